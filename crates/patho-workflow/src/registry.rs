//! 登记服务
//!
//! 所有写操作先校验、再由时钟打时间戳、最后交给存储层。

use chrono::{DateTime, Duration, SubsecRound, Utc};
use patho_core::*;
use patho_database::{Page, PathologyStore};
use std::sync::Arc;
use uuid::Uuid;

/// 病理登记服务
#[derive(Clone)]
pub struct PathologyService {
    store: Arc<dyn PathologyStore>,
    clock: Arc<dyn Clock>,
}

impl PathologyService {
    pub fn new(store: Arc<dyn PathologyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// 当前时间，截断到微秒与数据库精度一致
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// 新的更新时间，保证严格大于上一次
    fn next_update_stamp(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        let now = self.now();
        if now > previous {
            now
        } else {
            previous + Duration::microseconds(1)
        }
    }

    // ========== 患者 ==========

    pub async fn create_patient(&self, input: &PatientInput) -> Result<Patient> {
        let new_patient = input.validate()?;
        let patient = self.store.insert_patient(&new_patient).await?;
        tracing::info!("Created patient {}", patient.id);
        Ok(patient)
    }

    pub async fn get_patient(&self, id: i64) -> Result<Patient> {
        self.store
            .get_patient(id)
            .await?
            .ok_or_else(|| PathoError::not_found("patient", id))
    }

    pub async fn update_patient(&self, id: i64, update: &PatientUpdate) -> Result<Patient> {
        let existing = self.get_patient(id).await?;
        let updated = update.validate_against(&existing)?;
        if updated != existing {
            self.store.update_patient(&updated).await?;
            tracing::info!("Updated patient {}", id);
        }
        Ok(updated)
    }

    pub async fn search_patients(
        &self,
        name: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Patient>> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        self.store.search_patients(name, offset, limit).await
    }

    /// 删除患者并级联删除其图片，返回被删除的图片以便清理文件
    pub async fn delete_patient(&self, id: i64) -> Result<Vec<PathologyPicture>> {
        let pictures = self.store.pictures_for_patient(id).await?;
        self.store.delete_patient(id).await.map_err(|e| {
            if matches!(e, PathoError::ReferentialIntegrity(_)) {
                tracing::warn!("Refused to delete patient {}: {}", id, e);
            }
            e
        })?;
        tracing::info!("Deleted patient {} with {} pictures", id, pictures.len());
        Ok(pictures)
    }

    // ========== 病理图片 ==========

    /// 登记已经写入存储的图片
    pub async fn register_picture(
        &self,
        patient_id: i64,
        file: &str,
        checksum: &str,
        description: &str,
    ) -> Result<PathologyPicture> {
        validation::validate_description(description)?;
        self.get_patient(patient_id).await?;

        let picture = self
            .store
            .insert_picture(&NewPicture {
                patient_id,
                file: file.to_string(),
                description: description.to_string(),
                checksum: checksum.to_string(),
                created_at: self.now(),
            })
            .await?;
        tracing::info!("Registered picture {} for patient {}", picture.id, patient_id);
        Ok(picture)
    }

    pub async fn get_picture(&self, id: i64) -> Result<PathologyPicture> {
        self.store
            .get_picture(id)
            .await?
            .ok_or_else(|| PathoError::not_found("picture", id))
    }

    pub async fn pictures_for_patient(&self, patient_id: i64) -> Result<Vec<PathologyPicture>> {
        self.get_patient(patient_id).await?;
        self.store.pictures_for_patient(patient_id).await
    }

    /// 切图完成后翻转标记；重复调用是安全的
    pub async fn mark_picture_tiled(&self, id: i64) -> Result<bool> {
        let changed = self.store.mark_picture_cutted(id).await?;
        if changed {
            tracing::info!("Picture {} tiling completed", id);
        }
        Ok(changed)
    }

    /// 删除未被诊断引用的图片，返回被删除的记录
    pub async fn delete_picture(&self, id: i64) -> Result<PathologyPicture> {
        let picture = self.get_picture(id).await?;
        if let Err(e) = self.store.delete_picture(id).await {
            tracing::warn!("Refused to delete picture {}: {}", id, e);
            return Err(e);
        }
        tracing::info!("Deleted picture {}", id);
        Ok(picture)
    }

    // ========== 诊断 ==========

    pub async fn create_diagnosis(&self, input: &DiagnosisInput) -> Result<Diagnosis> {
        let new_diagnosis = input.validate(self.now())?;
        self.get_picture(new_diagnosis.picture_id).await?;

        let diagnosis = self.store.insert_diagnosis(&new_diagnosis).await?;
        tracing::info!(
            "Created diagnosis {} for picture {}",
            diagnosis.id,
            diagnosis.picture_id
        );
        Ok(diagnosis)
    }

    pub async fn get_diagnosis(&self, id: i64) -> Result<Diagnosis> {
        self.store
            .get_diagnosis(id)
            .await?
            .ok_or_else(|| PathoError::not_found("diagnosis", id))
    }

    /// 部分更新诊断
    ///
    /// 带 `expected_last_update` 时，与存储中的值不一致即返回冲突；
    /// 没有字段变化时原样返回，不刷新更新时间。
    pub async fn patch_diagnosis(&self, id: i64, patch: &DiagnosisPatch) -> Result<Diagnosis> {
        patch.validate()?;
        let current = self.get_diagnosis(id).await?;

        if let Some(expected) = patch.expected_last_update {
            if expected != current.last_update {
                tracing::warn!(
                    "Stale patch for diagnosis {}: expected {}, stored {}",
                    id,
                    expected,
                    current.last_update
                );
                return Err(PathoError::Conflict(format!(
                    "diagnosis {} was modified at {}",
                    id, current.last_update
                )));
            }
        }

        let mut updated = current.clone();
        if !patch.apply_to(&mut updated) {
            tracing::debug!("No-op patch for diagnosis {}", id);
            return Ok(current);
        }

        updated.last_update = self.next_update_stamp(current.last_update);
        self.store
            .update_diagnosis(&updated, current.last_update)
            .await?;
        tracing::info!("Updated diagnosis {}", id);
        Ok(updated)
    }

    /// 设置感兴趣区域图
    pub async fn set_region_picture(&self, id: i64, region_picture: &str) -> Result<Diagnosis> {
        let current = self.get_diagnosis(id).await?;
        let mut updated = current.clone();
        updated.region_picture = Some(region_picture.to_string());
        updated.last_update = self.next_update_stamp(current.last_update);

        self.store
            .update_diagnosis(&updated, current.last_update)
            .await?;
        tracing::info!("Set region picture for diagnosis {}", id);
        Ok(updated)
    }

    // ========== 分配 ==========

    pub async fn assign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<Vec<Uuid>> {
        self.get_diagnosis(diagnosis_id).await?;
        self.store.assign_clinician(diagnosis_id, clinician_id).await?;
        tracing::info!("Assigned diagnosis {} to clinician {}", diagnosis_id, clinician_id);
        self.store.assignees(diagnosis_id).await
    }

    pub async fn unassign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<()> {
        self.get_diagnosis(diagnosis_id).await?;
        if !self.store.unassign_clinician(diagnosis_id, clinician_id).await? {
            return Err(PathoError::NotFound(format!(
                "clinician {} is not assigned to diagnosis {}",
                clinician_id, diagnosis_id
            )));
        }
        tracing::info!("Unassigned clinician {} from diagnosis {}", clinician_id, diagnosis_id);
        Ok(())
    }

    pub async fn assignees(&self, diagnosis_id: i64) -> Result<Vec<Uuid>> {
        self.get_diagnosis(diagnosis_id).await?;
        self.store.assignees(diagnosis_id).await
    }

    // ========== 标注 ==========

    /// 添加标注，标注人必须是已认证的医生
    pub async fn add_label(
        &self,
        diagnosis_id: i64,
        input: &LabelInput,
        identity: &Identity,
    ) -> Result<LabelItem> {
        let author = identity.clinician_id().ok_or_else(|| {
            PathoError::Unauthorized("labels must be authored by a clinician".to_string())
        })?;
        let new_label = input.validate(diagnosis_id, author)?;
        self.get_diagnosis(diagnosis_id).await?;

        let now = self.now();
        let label = LabelItem {
            id: Uuid::new_v4(),
            diagnosis_id,
            category: new_label.category,
            x: new_label.x,
            y: new_label.y,
            w: new_label.w,
            h: new_label.h,
            zoom_level: new_label.zoom_level,
            confidence: new_label.confidence,
            author,
            region_picture: None,
            created_at: now,
            modified_at: now,
        };
        self.store.insert_label(&label).await?;
        tracing::info!(
            "Added {} label {} to diagnosis {}",
            label.category,
            label.id,
            diagnosis_id
        );
        Ok(label)
    }

    pub async fn labels(&self, diagnosis_id: i64) -> Result<Vec<LabelItem>> {
        self.get_diagnosis(diagnosis_id).await?;
        self.store.labels_for_diagnosis(diagnosis_id).await
    }

    pub async fn findings(&self, diagnosis_id: i64) -> Result<FindingsReport> {
        let labels = self.labels(diagnosis_id).await?;
        Ok(FindingsReport::from_labels(diagnosis_id, &labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use patho_database::MemoryStore;

    fn service() -> (PathologyService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let service = PathologyService::new(Arc::new(MemoryStore::new()), clock.clone());
        (service, clock)
    }

    fn clinician() -> Identity {
        Identity::Clinician(Clinician {
            id: Uuid::new_v4(),
            username: "dr.li".to_string(),
            name: "Dr. Li".to_string(),
        })
    }

    async fn seed(service: &PathologyService) -> (Patient, PathologyPicture, Diagnosis) {
        let patient = service
            .create_patient(&PatientInput {
                name: "张三".to_string(),
                sex: "F".to_string(),
                age: Some(45),
            })
            .await
            .unwrap();
        let picture = service
            .register_picture(patient.id, "origin/abc_slide.tif", "abc", "HE 染色")
            .await
            .unwrap();
        let diagnosis = service
            .create_diagnosis(&DiagnosisInput {
                picture_id: picture.id,
                high: Some(0.7),
                medium: Some(0.2),
                low: Some(0.1),
                advice: None,
                doctor_advice: None,
            })
            .await
            .unwrap();
        (patient, picture, diagnosis)
    }

    #[tokio::test]
    async fn test_timestamps_come_from_clock() {
        let (service, clock) = service();
        let (_, picture, diagnosis) = seed(&service).await;
        assert_eq!(picture.created_at, clock.now());
        assert_eq!(diagnosis.created_at, clock.now());
        assert_eq!(diagnosis.last_update, diagnosis.created_at);
        assert!(!picture.is_cutted);
    }

    #[tokio::test]
    async fn test_picture_delete_blocked_by_diagnosis() {
        let (service, _) = service();
        let (patient, picture, _) = seed(&service).await;

        let err = service.delete_picture(picture.id).await.unwrap_err();
        assert!(matches!(err, PathoError::ReferentialIntegrity(_)));
        let err = service.delete_patient(patient.id).await.unwrap_err();
        assert!(matches!(err, PathoError::ReferentialIntegrity(_)));
        assert!(service.get_picture(picture.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_undiagnosed_picture_can_be_deleted() {
        let (service, _) = service();
        let (patient, _, _) = seed(&service).await;
        let spare = service
            .register_picture(patient.id, "origin/def_spare.tif", "def", "")
            .await
            .unwrap();

        let deleted = service.delete_picture(spare.id).await.unwrap();
        assert_eq!(deleted.file, "origin/def_spare.tif");
        assert!(matches!(
            service.get_picture(spare.id).await,
            Err(PathoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_diagnosis_needs_existing_picture() {
        let (service, _) = service();
        let err = service
            .create_diagnosis(&DiagnosisInput {
                picture_id: 42,
                high: None,
                medium: None,
                low: None,
                advice: None,
                doctor_advice: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PathoError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_last_update_is_monotonic() {
        let (service, clock) = service();
        let (_, _, diagnosis) = seed(&service).await;

        clock.advance(Duration::seconds(5));
        let first = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    doctor_advice: Some("肿瘤细胞呈巢状分布".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(first.last_update > diagnosis.last_update);

        // 时钟没有前进时仍然严格递增
        let second = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    advice: Some("HER2 2+".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(second.last_update > first.last_update);

        // 时钟回拨也不会让更新时间倒退
        clock.advance(Duration::hours(-1));
        let third = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    is_finished: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(third.last_update > second.last_update);

        // 无变化的补丁保持原值
        let unchanged = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    is_finished: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(unchanged.last_update, third.last_update);
        assert_eq!(unchanged.created_at, diagnosis.created_at);
    }

    #[tokio::test]
    async fn test_stale_patch_conflicts() {
        let (service, clock) = service();
        let (_, _, diagnosis) = seed(&service).await;

        clock.advance(Duration::seconds(1));
        service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    advice: Some("first editor".to_string()),
                    expected_last_update: Some(diagnosis.last_update),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    advice: Some("second editor".to_string()),
                    expected_last_update: Some(diagnosis.last_update),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PathoError::Conflict(_)));

        let stored = service.get_diagnosis(diagnosis.id).await.unwrap();
        assert_eq!(stored.advice, "first editor");
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected_before_store() {
        let (service, _) = service();
        let (_, _, diagnosis) = seed(&service).await;
        let err = service
            .patch_diagnosis(
                diagnosis.id,
                &DiagnosisPatch {
                    low: Some(-3.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PathoError::Validation(_)));
        assert_eq!(service.get_diagnosis(diagnosis.id).await.unwrap().low, 0.1);
    }

    #[tokio::test]
    async fn test_labels_and_findings() {
        let (service, _) = service();
        let (_, _, diagnosis) = seed(&service).await;
        let doctor = clinician();

        let input = LabelInput {
            category: Some("HSIL".to_string()),
            x: 10.0,
            y: 20.0,
            w: 100.0,
            h: 80.0,
            zoom_level: Some(20.0),
            confidence: Some(0.8),
        };
        let label = service.add_label(diagnosis.id, &input, &doctor).await.unwrap();
        assert_eq!(Some(label.author), doctor.clinician_id());

        let err = service
            .add_label(diagnosis.id, &input, &Identity::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, PathoError::Unauthorized(_)));

        let bad = LabelInput {
            category: Some("BOGUS".to_string()),
            ..input
        };
        let err = service.add_label(diagnosis.id, &bad, &doctor).await.unwrap_err();
        assert!(matches!(err, PathoError::Validation(_)));

        let findings = service.findings(diagnosis.id).await.unwrap();
        assert_eq!(findings.findings, vec![LabelCategory::Hsil]);
        assert_eq!(findings.label_count, 1);
    }

    #[tokio::test]
    async fn test_assignments() {
        let (service, _) = service();
        let (_, _, diagnosis) = seed(&service).await;
        let doctor = Uuid::new_v4();

        assert_eq!(
            service.assign_clinician(diagnosis.id, doctor).await.unwrap(),
            vec![doctor]
        );
        service.unassign_clinician(diagnosis.id, doctor).await.unwrap();
        assert!(matches!(
            service.unassign_clinician(diagnosis.id, doctor).await,
            Err(PathoError::NotFound(_))
        ));
        assert!(matches!(
            service.assign_clinician(999, doctor).await,
            Err(PathoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_tiled_and_region() {
        let (service, _) = service();
        let (_, picture, diagnosis) = seed(&service).await;

        assert!(service.mark_picture_tiled(picture.id).await.unwrap());
        assert!(!service.mark_picture_tiled(picture.id).await.unwrap());

        let updated = service
            .set_region_picture(diagnosis.id, "region/roi.png")
            .await
            .unwrap();
        assert_eq!(updated.region_picture.as_deref(), Some("region/roi.png"));
        assert!(updated.last_update > diagnosis.last_update);
    }

    #[tokio::test]
    async fn test_patient_search_and_update() {
        let (service, _) = service();
        seed(&service).await;
        let page = service.search_patients(Some("张"), 0, 10).await.unwrap();
        assert_eq!(page.total, 1);

        let updated = service
            .update_patient(
                page.items[0].id,
                &PatientUpdate {
                    sex: Some("M".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.sex, Sex::Male);
        assert_eq!(updated.age, Some(45));
    }
}
