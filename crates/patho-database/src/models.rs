//! 数据库模型

use chrono::{DateTime, Utc};
use patho_core::*;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: i64,
    pub name: String,
    pub sex: String, // 存储为单字符代码
    pub age: Option<i16>,
}

impl TryFrom<DbPatient> for Patient {
    type Error = PathoError;

    fn try_from(db_patient: DbPatient) -> Result<Self> {
        let sex = db_patient
            .sex
            .parse::<Sex>()
            .map_err(|e| PathoError::Database(format!("patient {}: {}", db_patient.id, e)))?;
        Ok(Patient {
            id: db_patient.id,
            name: db_patient.name,
            sex,
            age: db_patient.age.map(|a| a.max(0) as u16),
        })
    }
}

/// 数据库病理图片表
#[derive(Debug, FromRow)]
pub struct DbPicture {
    pub id: i64,
    pub patient_id: i64,
    pub file: String,
    pub description: String,
    pub checksum: String,
    pub is_cutted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbPicture> for PathologyPicture {
    fn from(db: DbPicture) -> Self {
        PathologyPicture {
            id: db.id,
            patient_id: db.patient_id,
            file: db.file,
            description: db.description,
            checksum: db.checksum,
            is_cutted: db.is_cutted,
            created_at: db.created_at,
        }
    }
}

/// 数据库诊断表
#[derive(Debug, FromRow)]
pub struct DbDiagnosis {
    pub id: i64,
    pub picture_id: i64,
    pub region_picture: Option<String>,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub advice: String,
    pub doctor_advice: String,
    pub is_finished: bool,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl From<DbDiagnosis> for Diagnosis {
    fn from(db: DbDiagnosis) -> Self {
        Diagnosis {
            id: db.id,
            picture_id: db.picture_id,
            region_picture: db.region_picture,
            high: db.high,
            medium: db.medium,
            low: db.low,
            advice: db.advice,
            doctor_advice: db.doctor_advice,
            is_finished: db.is_finished,
            created_at: db.created_at,
            last_update: db.last_update,
        }
    }
}

/// 数据库标注表
#[derive(Debug, FromRow)]
pub struct DbLabelItem {
    pub id: Uuid,
    pub diagnosis_id: i64,
    pub category: String, // 分类代码
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub zoom_level: f64,
    pub confidence: f64,
    pub author: Uuid,
    pub region_picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TryFrom<DbLabelItem> for LabelItem {
    type Error = PathoError;

    fn try_from(db: DbLabelItem) -> Result<Self> {
        let category = db
            .category
            .parse::<LabelCategory>()
            .map_err(|e| PathoError::Database(format!("label {}: {}", db.id, e)))?;
        Ok(LabelItem {
            id: db.id,
            diagnosis_id: db.diagnosis_id,
            category,
            x: db.x,
            y: db.y,
            w: db.w,
            h: db.h,
            zoom_level: db.zoom_level,
            confidence: db.confidence,
            author: db.author,
            region_picture: db.region_picture,
            created_at: db.created_at,
            modified_at: db.modified_at,
        })
    }
}
