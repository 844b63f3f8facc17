//! 医生身份认证
//!
//! 请求可以不带凭证（匿名），也可以带 `Authorization: Bearer <token>`。
//! 令牌只以 SHA-256 摘要的形式保存在配置中。

use crate::error::ApiError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use patho_core::{Clinician, Identity, PathoError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 令牌的 SHA-256 十六进制摘要
pub fn hash_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// 认证服务
#[derive(Debug, Default, Clone)]
pub struct AuthService {
    clinicians: HashMap<String, Clinician>,
}

impl AuthService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记医生，`token_sha256` 为令牌摘要
    pub fn with_clinician(mut self, token_sha256: &str, clinician: Clinician) -> Self {
        self.clinicians
            .insert(token_sha256.trim().to_ascii_lowercase(), clinician);
        self
    }

    pub fn clinician_count(&self) -> usize {
        self.clinicians.len()
    }

    pub fn verify_token(&self, token: &str) -> Option<&Clinician> {
        self.clinicians.get(&hash_token(token))
    }

    /// 由 Authorization 头确定身份；头缺失为匿名，凭证无效为错误
    pub fn identify(&self, authorization: Option<&str>) -> Result<Identity, PathoError> {
        let Some(value) = authorization else {
            return Ok(Identity::Anonymous);
        };
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PathoError::Unauthorized("expected a bearer token".to_string()))?;

        self.verify_token(token)
            .cloned()
            .map(Identity::Clinician)
            .ok_or_else(|| PathoError::Unauthorized("invalid token".to_string()))
    }
}

/// 把请求方身份放进请求扩展
pub async fn identity_middleware(
    State(auth_service): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|h| h.to_str().unwrap_or_default());

    let identity = match auth_service.identify(authorization) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected credentials for {} {}: {}", request.method(), request.uri(), e);
            return Err(e.into());
        }
    };
    if let Identity::Clinician(clinician) = &identity {
        debug!("Request by clinician {}", clinician.username);
    }

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
