//! 存储接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patho_core::{
    Diagnosis, LabelItem, NewDiagnosis, NewPatient, NewPicture, PathologyPicture, Patient, Result,
};
use serde::Serialize;
use uuid::Uuid;

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// 满足条件的总数
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// 从已按顺序排好的完整结果中截取一页
    pub fn slice(all: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = all.len();
        let items = all.into_iter().skip(offset).take(limit).collect();
        Self {
            total,
            offset,
            limit,
            items,
        }
    }

    /// 下一页的偏移，没有下一页时为 `None`
    pub fn next_offset(&self) -> Option<usize> {
        let next = self.offset.checked_add(self.limit)?;
        (self.limit > 0 && next < self.total).then_some(next)
    }

    /// 上一页的偏移，当前已是第一页时为 `None`
    pub fn previous_offset(&self) -> Option<usize> {
        (self.offset > 0).then(|| self.offset.saturating_sub(self.limit))
    }
}

/// 诊断列表过滤条件，结果始终按 id 升序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosisFilter {
    pub is_finished: Option<bool>,
    /// 只返回分配给该医生的诊断
    pub assigned_to: Option<Uuid>,
    pub offset: usize,
    pub limit: usize,
}

/// 病理数据存储
///
/// 实现必须保证：
/// - 删除患者时级联删除其图片，但任何图片被诊断引用时整个删除失败
/// - 被诊断引用的图片不能删除
/// - `update_diagnosis` 以 `last_update` 做比较交换
#[async_trait]
pub trait PathologyStore: Send + Sync {
    // ========== 患者 ==========

    async fn insert_patient(&self, patient: &NewPatient) -> Result<Patient>;

    async fn get_patient(&self, id: i64) -> Result<Option<Patient>>;

    async fn update_patient(&self, patient: &Patient) -> Result<()>;

    /// 按姓名子串搜索患者
    async fn search_patients(
        &self,
        name: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Patient>>;

    async fn delete_patient(&self, id: i64) -> Result<()>;

    // ========== 病理图片 ==========

    async fn insert_picture(&self, picture: &NewPicture) -> Result<PathologyPicture>;

    async fn get_picture(&self, id: i64) -> Result<Option<PathologyPicture>>;

    async fn pictures_for_patient(&self, patient_id: i64) -> Result<Vec<PathologyPicture>>;

    /// 标记切图完成，返回标记是否发生了变化
    async fn mark_picture_cutted(&self, id: i64) -> Result<bool>;

    async fn delete_picture(&self, id: i64) -> Result<()>;

    // ========== 诊断 ==========

    async fn insert_diagnosis(&self, diagnosis: &NewDiagnosis) -> Result<Diagnosis>;

    async fn get_diagnosis(&self, id: i64) -> Result<Option<Diagnosis>>;

    /// 仅当存储中的 `last_update` 等于 `expected_last_update` 时写入
    async fn update_diagnosis(
        &self,
        diagnosis: &Diagnosis,
        expected_last_update: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_diagnoses(&self, filter: &DiagnosisFilter) -> Result<Page<Diagnosis>>;

    // ========== 分配 ==========

    async fn assign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<()>;

    /// 返回是否确实移除了分配
    async fn unassign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<bool>;

    async fn assignees(&self, diagnosis_id: i64) -> Result<Vec<Uuid>>;

    // ========== 标注 ==========

    async fn insert_label(&self, label: &LabelItem) -> Result<()>;

    async fn labels_for_diagnosis(&self, diagnosis_id: i64) -> Result<Vec<LabelItem>>;
}
