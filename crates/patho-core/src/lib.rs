//! # Patho Core
//!
//! 病理辅助诊断系统的核心模块，提供基础数据结构、错误定义、字段校验和时钟抽象。

pub mod clock;
pub mod error;
pub mod labels;
pub mod models;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FieldError, PathoError, Result, ValidationErrors};
pub use labels::*;
pub use models::*;
