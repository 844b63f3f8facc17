//! # 病理工作流模块
//!
//! 提供诊断工作流的服务层：
//! - 登记服务：患者、病理图片、诊断和标注的校验与增改，时间戳由注入的时钟写入
//! - 诊断列表：按身份、完成状态过滤并分页

pub mod listing;
pub mod registry;

// 重新导出主要类型
pub use listing::{DiagnosisListing, ListQuery, ListingPolicy};
pub use registry::PathologyService;
