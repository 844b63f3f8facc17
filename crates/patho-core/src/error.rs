//! 错误定义模块

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 单个字段的校验失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// 按字段收集的校验错误
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只有一个字段出错时的便捷构造
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|e| e.field == field)
    }

    /// 没有错误时返回 `Ok(())`，否则转为 [`PathoError::Validation`]
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(PathoError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// 病理系统统一错误类型
#[derive(Error, Debug)]
pub enum PathoError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(ValidationErrors),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("引用完整性错误: {0}")]
    ReferentialIntegrity(String),

    #[error("并发冲突: {0}")]
    Conflict(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("报告模板错误: {0}")]
    Template(String),

    #[error("图像处理错误: {0}")]
    Image(String),

    #[error("切图任务错误: {0}")]
    Tiling(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl PathoError {
    /// 单字段校验错误
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        PathoError::Validation(ValidationErrors::single(field, message))
    }

    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        PathoError::NotFound(format!("{} {} not found", kind, id))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PathoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PathoError::NotFound("row not found".to_string()),
            other => PathoError::Database(other.to_string()),
        }
    }
}

/// 病理系统统一结果类型
pub type Result<T> = std::result::Result<T, PathoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_collect_fields() {
        let mut errors = ValidationErrors::new();
        assert!(errors.clone().into_result().is_ok());

        errors.add("age", "must not be negative");
        errors.add("name", "must not be empty");

        assert!(errors.has_field("age"));
        assert!(!errors.has_field("sex"));
        assert_eq!(
            errors.to_string(),
            "age: must not be negative; name: must not be empty"
        );

        match errors.into_result() {
            Err(PathoError::Validation(e)) => assert_eq!(e.fields.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
