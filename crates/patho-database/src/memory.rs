//! 内存存储
//!
//! 与 PostgreSQL 实现遵守相同的级联和保护规则，用于测试和单机演示。

use crate::store::{DiagnosisFilter, Page, PathologyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patho_core::{
    Diagnosis, LabelItem, NewDiagnosis, NewPatient, NewPicture, PathoError, PathologyPicture,
    Patient, Result,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    next_patient_id: i64,
    next_picture_id: i64,
    next_diagnosis_id: i64,
    patients: BTreeMap<i64, Patient>,
    pictures: BTreeMap<i64, PathologyPicture>,
    diagnoses: BTreeMap<i64, Diagnosis>,
    assignments: BTreeSet<(i64, Uuid)>,
    labels: Vec<LabelItem>,
}

impl Tables {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }

    fn picture_is_referenced(&self, picture_id: i64) -> bool {
        self.diagnoses.values().any(|d| d.picture_id == picture_id)
    }
}

/// 基于 `RwLock` 的内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PathologyStore for MemoryStore {
    async fn insert_patient(&self, patient: &NewPatient) -> Result<Patient> {
        let mut tables = self.tables.write().await;
        let id = Tables::next_id(&mut tables.next_patient_id);
        let patient = Patient {
            id,
            name: patient.name.clone(),
            sex: patient.sex,
            age: patient.age,
        };
        tables.patients.insert(id, patient.clone());
        Ok(patient)
    }

    async fn get_patient(&self, id: i64) -> Result<Option<Patient>> {
        Ok(self.tables.read().await.patients.get(&id).cloned())
    }

    async fn update_patient(&self, patient: &Patient) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.patients.get_mut(&patient.id) {
            Some(slot) => {
                *slot = patient.clone();
                Ok(())
            }
            None => Err(PathoError::not_found("patient", patient.id)),
        }
    }

    async fn search_patients(
        &self,
        name: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Patient>> {
        let tables = self.tables.read().await;
        let needle = name.map(|n| n.to_lowercase());
        let matching: Vec<Patient> = tables
            .patients
            .values()
            .filter(|p| match &needle {
                Some(n) => p.name.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        Ok(Page::slice(matching, offset, limit))
    }

    async fn delete_patient(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.patients.contains_key(&id) {
            return Err(PathoError::not_found("patient", id));
        }

        let picture_ids: Vec<i64> = tables
            .pictures
            .values()
            .filter(|p| p.patient_id == id)
            .map(|p| p.id)
            .collect();

        if let Some(protected) = picture_ids.iter().find(|p| tables.picture_is_referenced(**p)) {
            return Err(PathoError::ReferentialIntegrity(format!(
                "patient {} cannot be deleted: picture {} is referenced by a diagnosis",
                id, protected
            )));
        }

        for picture_id in picture_ids {
            tables.pictures.remove(&picture_id);
        }
        tables.patients.remove(&id);
        Ok(())
    }

    async fn insert_picture(&self, picture: &NewPicture) -> Result<PathologyPicture> {
        let mut tables = self.tables.write().await;
        if !tables.patients.contains_key(&picture.patient_id) {
            return Err(PathoError::not_found("patient", picture.patient_id));
        }
        let id = Tables::next_id(&mut tables.next_picture_id);
        let picture = PathologyPicture {
            id,
            patient_id: picture.patient_id,
            file: picture.file.clone(),
            description: picture.description.clone(),
            checksum: picture.checksum.clone(),
            is_cutted: false,
            created_at: picture.created_at,
        };
        tables.pictures.insert(id, picture.clone());
        Ok(picture)
    }

    async fn get_picture(&self, id: i64) -> Result<Option<PathologyPicture>> {
        Ok(self.tables.read().await.pictures.get(&id).cloned())
    }

    async fn pictures_for_patient(&self, patient_id: i64) -> Result<Vec<PathologyPicture>> {
        let tables = self.tables.read().await;
        Ok(tables
            .pictures
            .values()
            .filter(|p| p.patient_id == patient_id)
            .cloned()
            .collect())
    }

    async fn mark_picture_cutted(&self, id: i64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let picture = tables
            .pictures
            .get_mut(&id)
            .ok_or_else(|| PathoError::not_found("picture", id))?;
        let changed = !picture.is_cutted;
        picture.is_cutted = true;
        Ok(changed)
    }

    async fn delete_picture(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.pictures.contains_key(&id) {
            return Err(PathoError::not_found("picture", id));
        }
        if tables.picture_is_referenced(id) {
            return Err(PathoError::ReferentialIntegrity(format!(
                "picture {} is referenced by a diagnosis",
                id
            )));
        }
        tables.pictures.remove(&id);
        Ok(())
    }

    async fn insert_diagnosis(&self, diagnosis: &NewDiagnosis) -> Result<Diagnosis> {
        let mut tables = self.tables.write().await;
        if !tables.pictures.contains_key(&diagnosis.picture_id) {
            return Err(PathoError::not_found("picture", diagnosis.picture_id));
        }
        let id = Tables::next_id(&mut tables.next_diagnosis_id);
        let diagnosis = Diagnosis {
            id,
            picture_id: diagnosis.picture_id,
            region_picture: None,
            high: diagnosis.high,
            medium: diagnosis.medium,
            low: diagnosis.low,
            advice: diagnosis.advice.clone(),
            doctor_advice: diagnosis.doctor_advice.clone(),
            is_finished: false,
            created_at: diagnosis.created_at,
            last_update: diagnosis.created_at,
        };
        tables.diagnoses.insert(id, diagnosis.clone());
        Ok(diagnosis)
    }

    async fn get_diagnosis(&self, id: i64) -> Result<Option<Diagnosis>> {
        Ok(self.tables.read().await.diagnoses.get(&id).cloned())
    }

    async fn update_diagnosis(
        &self,
        diagnosis: &Diagnosis,
        expected_last_update: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .diagnoses
            .get_mut(&diagnosis.id)
            .ok_or_else(|| PathoError::not_found("diagnosis", diagnosis.id))?;

        if stored.last_update != expected_last_update {
            return Err(PathoError::Conflict(format!(
                "diagnosis {} was modified at {}",
                diagnosis.id, stored.last_update
            )));
        }

        // 关联字段和创建时间不随更新改变
        let picture_id = stored.picture_id;
        let created_at = stored.created_at;
        *stored = diagnosis.clone();
        stored.picture_id = picture_id;
        stored.created_at = created_at;
        Ok(())
    }

    async fn list_diagnoses(&self, filter: &DiagnosisFilter) -> Result<Page<Diagnosis>> {
        let tables = self.tables.read().await;
        let matching: Vec<Diagnosis> = tables
            .diagnoses
            .values()
            .filter(|d| filter.is_finished.map_or(true, |f| d.is_finished == f))
            .filter(|d| match filter.assigned_to {
                Some(clinician) => tables.assignments.contains(&(d.id, clinician)),
                None => true,
            })
            .cloned()
            .collect();
        Ok(Page::slice(matching, filter.offset, filter.limit))
    }

    async fn assign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.diagnoses.contains_key(&diagnosis_id) {
            return Err(PathoError::not_found("diagnosis", diagnosis_id));
        }
        tables.assignments.insert((diagnosis_id, clinician_id));
        Ok(())
    }

    async fn unassign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.assignments.remove(&(diagnosis_id, clinician_id)))
    }

    async fn assignees(&self, diagnosis_id: i64) -> Result<Vec<Uuid>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignments
            .iter()
            .filter(|(d, _)| *d == diagnosis_id)
            .map(|(_, clinician)| *clinician)
            .collect())
    }

    async fn insert_label(&self, label: &LabelItem) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.diagnoses.contains_key(&label.diagnosis_id) {
            return Err(PathoError::not_found("diagnosis", label.diagnosis_id));
        }
        tables.labels.push(label.clone());
        Ok(())
    }

    async fn labels_for_diagnosis(&self, diagnosis_id: i64) -> Result<Vec<LabelItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .labels
            .iter()
            .filter(|l| l.diagnosis_id == diagnosis_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patho_core::Sex;

    async fn seeded() -> (MemoryStore, Patient, PathologyPicture) {
        let store = MemoryStore::new();
        let patient = store
            .insert_patient(&NewPatient {
                name: "张三".to_string(),
                sex: Sex::Female,
                age: Some(50),
            })
            .await
            .unwrap();
        let picture = store
            .insert_picture(&NewPicture {
                patient_id: patient.id,
                file: "origin/slide-1.tif".to_string(),
                description: "HE".to_string(),
                checksum: "abc".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        (store, patient, picture)
    }

    fn new_diagnosis(picture_id: i64) -> NewDiagnosis {
        NewDiagnosis {
            picture_id,
            high: 1.0,
            medium: 1.0,
            low: 1.0,
            advice: String::new(),
            doctor_advice: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_referenced_picture_is_protected() {
        let (store, patient, picture) = seeded().await;
        store.insert_diagnosis(&new_diagnosis(picture.id)).await.unwrap();

        let err = store.delete_picture(picture.id).await.unwrap_err();
        assert!(matches!(err, PathoError::ReferentialIntegrity(_)));

        // 级联删除同样被阻止，且不会删掉任何东西
        let err = store.delete_patient(patient.id).await.unwrap_err();
        assert!(matches!(err, PathoError::ReferentialIntegrity(_)));
        assert!(store.get_patient(patient.id).await.unwrap().is_some());
        assert!(store.get_picture(picture.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_name_search_is_literal() {
        let (store, _, _) = seeded().await;
        store
            .insert_patient(&NewPatient {
                name: "李_四".to_string(),
                sex: Sex::Male,
                age: None,
            })
            .await
            .unwrap();

        let all = store.search_patients(None, 0, 10).await.unwrap();
        assert_eq!(all.total, 2);
        let underscore = store.search_patients(Some("_"), 0, 10).await.unwrap();
        assert_eq!(underscore.total, 1);
        assert_eq!(underscore.items[0].name, "李_四");
        let percent = store.search_patients(Some("%"), 0, 10).await.unwrap();
        assert_eq!(percent.total, 0);
    }

    #[tokio::test]
    async fn test_patient_delete_cascades_to_pictures() {
        let (store, patient, picture) = seeded().await;
        store.delete_patient(patient.id).await.unwrap();
        assert!(store.get_picture(picture.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_patient(patient.id).await,
            Err(PathoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_diagnosis_requires_picture() {
        let store = MemoryStore::new();
        let err = store.insert_diagnosis(&new_diagnosis(99)).await.unwrap_err();
        assert!(matches!(err, PathoError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let (store, _, picture) = seeded().await;
        let d = store.insert_diagnosis(&new_diagnosis(picture.id)).await.unwrap();

        let mut updated = d.clone();
        updated.advice = "first".to_string();
        updated.last_update = d.last_update + chrono::Duration::seconds(1);
        store.update_diagnosis(&updated, d.last_update).await.unwrap();

        // 基于旧版本的第二次写入被拒绝
        let mut stale = d.clone();
        stale.advice = "second".to_string();
        let err = store.update_diagnosis(&stale, d.last_update).await.unwrap_err();
        assert!(matches!(err, PathoError::Conflict(_)));

        let stored = store.get_diagnosis(d.id).await.unwrap().unwrap();
        assert_eq!(stored.advice, "first");
    }

    #[tokio::test]
    async fn test_listing_filters_and_orders() {
        let (store, _, picture) = seeded().await;
        let clinician = Uuid::new_v4();
        for i in 0..5 {
            let d = store.insert_diagnosis(&new_diagnosis(picture.id)).await.unwrap();
            if i % 2 == 0 {
                let mut finished = d.clone();
                finished.is_finished = true;
                store.update_diagnosis(&finished, d.last_update).await.unwrap();
                store.assign_clinician(d.id, clinician).await.unwrap();
            }
        }

        let page = store
            .list_diagnoses(&DiagnosisFilter {
                is_finished: Some(true),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<i64> = page.items.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);

        let page = store
            .list_diagnoses(&DiagnosisFilter {
                assigned_to: Some(Uuid::new_v4()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 0);

        assert_eq!(store.assignees(1).await.unwrap(), vec![clinician]);
        assert!(store.unassign_clinician(1, clinician).await.unwrap());
        assert!(!store.unassign_clinician(1, clinician).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_cutted_is_idempotent() {
        let (store, _, picture) = seeded().await;
        assert!(store.mark_picture_cutted(picture.id).await.unwrap());
        assert!(!store.mark_picture_cutted(picture.id).await.unwrap());
        assert!(store.get_picture(picture.id).await.unwrap().unwrap().is_cutted);
    }
}
