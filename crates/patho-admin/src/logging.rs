//! 日志初始化

use crate::config::LoggingConfig;
use patho_core::{PathoError, Result};
use tracing_subscriber::EnvFilter;

/// 解析 `EnvFilter` 指令
pub fn build_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| PathoError::Config(format!("invalid log filter '{}': {}", directives, e)))
}

/// 安装全局 subscriber，只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| PathoError::Config(format!("failed to install logger: {}", e)))?;

    tracing::debug!(level = %config.level, json = config.json, "Logging initialised");
    Ok(())
}
