//! # 病理 Web 接口
//!
//! 基于 axum 的 REST 接口：患者、病理图片、诊断、标注和报告下载。

pub mod auth;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod report;
pub mod server;
pub mod state;

pub use auth::{hash_token, AuthService};
pub use error::ApiError;
pub use server::{create_app, WebServer};
pub use state::{AppState, UploadSettings};
