//! 诊断列表查询
//!
//! 匿名请求看到全部诊断；已认证的医生只看到分配给自己的诊断。

use patho_core::{Diagnosis, Identity, PathoError, Result};
use patho_database::{DiagnosisFilter, Page, PathologyStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 分页策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPolicy {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for ListingPolicy {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

impl ListingPolicy {
    /// 解析每页条数：缺省取默认值，0 视为非法，超过上限时截断
    pub fn page_size(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            None => Ok(self.default_limit),
            Some(0) => Err(PathoError::invalid("limit", "must be at least 1")),
            Some(n) => Ok(n.min(self.max_limit)),
        }
    }

    /// 解析起始偏移：缺省为 0，超出数据库 BIGINT 范围的偏移视为非法
    pub fn offset(&self, requested: Option<usize>) -> Result<usize> {
        let offset = requested.unwrap_or(0);
        if i64::try_from(offset).is_err() {
            return Err(PathoError::invalid(
                "offset",
                format!("must not exceed {}", i64::MAX),
            ));
        }
        Ok(offset)
    }
}

/// 列表查询参数
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListQuery {
    #[serde(default, rename = "isFinished", alias = "is_finished")]
    pub is_finished: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// 诊断列表服务
#[derive(Clone)]
pub struct DiagnosisListing {
    store: Arc<dyn PathologyStore>,
    policy: ListingPolicy,
}

impl DiagnosisListing {
    pub fn new(store: Arc<dyn PathologyStore>, policy: ListingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ListingPolicy {
        self.policy
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> Result<Page<Diagnosis>> {
        let filter = self.filter_for(identity, query)?;
        self.store.list_diagnoses(&filter).await
    }

    fn filter_for(&self, identity: &Identity, query: &ListQuery) -> Result<DiagnosisFilter> {
        let limit = self.policy.page_size(query.limit)?;
        let offset = self.policy.offset(query.offset)?;
        let assigned_to = match identity {
            Identity::Anonymous => {
                tracing::warn!("Anonymous diagnosis listing, returning unscoped results");
                None
            }
            Identity::Clinician(clinician) => Some(clinician.id),
        };

        Ok(DiagnosisFilter {
            is_finished: query.is_finished,
            assigned_to,
            offset,
            limit,
        })
    }
}
