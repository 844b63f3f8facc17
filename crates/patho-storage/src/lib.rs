//! # 病理存储模块
//!
//! 负责切片原图、区域图和切图产物在媒体目录下的存放。

pub mod storage;

pub use storage::*;
