//! # 病理数据库模块
//!
//! 负责患者、病理图片、诊断、分配关系和标注的持久化。提供统一的
//! [`PathologyStore`] 接口，以及 PostgreSQL 和内存两种实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::{DatabasePool, PoolOptions};
pub use memory::MemoryStore;
pub use queries::PgStore;
pub use store::{DiagnosisFilter, Page, PathologyStore};
