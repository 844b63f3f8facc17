//! # 系统管理模块
//!
//! 分层配置（默认值、TOML 文件、`PATHO_` 环境变量）和日志初始化。

pub mod config;
pub mod logging;

pub use config::{
    AuthConfig, ClinicianEntry, ConfigManager, ConfigValidator, DatabaseBackend, DatabaseConfig,
    ListingConfig, LoggingConfig, PathoConfig, ReportConfig, ServerConfig, StorageConfig,
    TilingConfig,
};
pub use logging::{build_filter, init_logging};
