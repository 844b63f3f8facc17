//! PostgreSQL 存储实现

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::{DiagnosisFilter, Page, PathologyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patho_core::{
    Diagnosis, LabelItem, NewDiagnosis, NewPatient, NewPicture, PathoError, PathologyPicture,
    Patient, Result,
};
use sqlx::Row;
use uuid::Uuid;

const FOREIGN_KEY_VIOLATION: &str = "23503";

/// 外键冲突转为引用完整性错误，其余作为数据库错误
fn map_write_error(err: sqlx::Error, context: &str) -> PathoError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
            return PathoError::ReferentialIntegrity(format!("{}: {}", context, db_err.message()));
        }
    }
    PathoError::Database(err.to_string())
}

/// 分页参数转为 BIGINT，超出范围时报告对应字段
fn bigint(field: &str, value: usize) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| PathoError::invalid(field, format!("must not exceed {}", i64::MAX)))
}

/// 构造按子串匹配的 ILIKE 模式，转义用户输入中的通配符
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// 基于 PostgreSQL 的存储
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                sex CHAR(1) NOT NULL,
                age SMALLINT CHECK (age >= 0)
            )
        "#).execute(pool).await?;

        // 创建病理图片表，随患者级联删除
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS pathology_pictures (
                id BIGSERIAL PRIMARY KEY,
                patient_id BIGINT NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
                file VARCHAR(512) NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                checksum CHAR(64) NOT NULL,
                is_cutted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#).execute(pool).await?;

        // 创建诊断表，被引用的图片禁止删除
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS diagnoses (
                id BIGSERIAL PRIMARY KEY,
                picture_id BIGINT NOT NULL REFERENCES pathology_pictures(id) ON DELETE RESTRICT,
                region_picture VARCHAR(512),
                high DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                medium DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                low DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                advice TEXT NOT NULL DEFAULT '',
                doctor_advice TEXT NOT NULL DEFAULT '',
                is_finished BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                last_update TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#).execute(pool).await?;

        // 创建分配表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS diagnosis_assignments (
                diagnosis_id BIGINT NOT NULL REFERENCES diagnoses(id) ON DELETE CASCADE,
                clinician_id UUID NOT NULL,
                PRIMARY KEY (diagnosis_id, clinician_id)
            )
        "#).execute(pool).await?;

        // 创建标注表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS label_items (
                id UUID PRIMARY KEY,
                diagnosis_id BIGINT NOT NULL REFERENCES diagnoses(id) ON DELETE RESTRICT,
                category VARCHAR(20) NOT NULL,
                x DOUBLE PRECISION NOT NULL,
                y DOUBLE PRECISION NOT NULL,
                w DOUBLE PRECISION NOT NULL,
                h DOUBLE PRECISION NOT NULL,
                zoom_level DOUBLE PRECISION NOT NULL DEFAULT 10.0,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                author UUID NOT NULL,
                region_picture VARCHAR(512),
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                modified_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(name)",
            "CREATE INDEX IF NOT EXISTS idx_pictures_patient_id ON pathology_pictures(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_diagnoses_picture_id ON diagnoses(picture_id)",
            "CREATE INDEX IF NOT EXISTS idx_diagnoses_is_finished ON diagnoses(is_finished)",
            "CREATE INDEX IF NOT EXISTS idx_assignments_clinician ON diagnosis_assignments(clinician_id)",
            "CREATE INDEX IF NOT EXISTS idx_labels_diagnosis_id ON label_items(diagnosis_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }
}

#[async_trait]
impl PathologyStore for PgStore {
    // ========== 患者相关操作 ==========

    async fn insert_patient(&self, patient: &NewPatient) -> Result<Patient> {
        let row = sqlx::query_as::<_, DbPatient>(
            "INSERT INTO patients (name, sex, age) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&patient.name)
        .bind(patient.sex.code())
        .bind(patient.age.map(|a| a as i16))
        .fetch_one(self.pool.pool())
        .await?;

        Patient::try_from(row)
    }

    async fn get_patient(&self, id: i64) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(Patient::try_from).transpose()
    }

    async fn update_patient(&self, patient: &Patient) -> Result<()> {
        let result = sqlx::query("UPDATE patients SET name = $1, sex = $2, age = $3 WHERE id = $4")
            .bind(&patient.name)
            .bind(patient.sex.code())
            .bind(patient.age.map(|a| a as i16))
            .bind(patient.id)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(PathoError::not_found("patient", patient.id));
        }
        Ok(())
    }

    async fn search_patients(
        &self,
        name: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Patient>> {
        let pool = self.pool.pool();
        let pattern = name.map(contains_pattern);
        let limit_param = bigint("limit", limit)?;
        let offset_param = bigint("offset", offset)?;

        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM patients WHERE ($1::text IS NULL OR name ILIKE $1 ESCAPE '\\')",
        )
        .bind(&pattern)
        .fetch_one(pool)
        .await?
        .get("total");

        let rows = sqlx::query_as::<_, DbPatient>(
            "SELECT * FROM patients WHERE ($1::text IS NULL OR name ILIKE $1 ESCAPE '\\') \
             ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(&pattern)
        .bind(limit_param)
        .bind(offset_param)
        .fetch_all(pool)
        .await?;

        let items = rows
            .into_iter()
            .map(Patient::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            total: total as usize,
            offset,
            limit,
            items,
        })
    }

    async fn delete_patient(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM patients WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_write_error(e, &format!("patient {} has diagnosed pictures", id)))?;

        if result.rows_affected() == 0 {
            return Err(PathoError::not_found("patient", id));
        }
        Ok(())
    }

    // ========== 病理图片相关操作 ==========

    async fn insert_picture(&self, picture: &NewPicture) -> Result<PathologyPicture> {
        let row = sqlx::query_as::<_, DbPicture>(
            r#"
            INSERT INTO pathology_pictures (patient_id, file, description, checksum, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
        "#,
        )
        .bind(picture.patient_id)
        .bind(&picture.file)
        .bind(&picture.description)
        .bind(&picture.checksum)
        .bind(picture.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| match map_write_error(e, "insert picture") {
            PathoError::ReferentialIntegrity(_) => {
                PathoError::not_found("patient", picture.patient_id)
            }
            other => other,
        })?;

        Ok(PathologyPicture::from(row))
    }

    async fn get_picture(&self, id: i64) -> Result<Option<PathologyPicture>> {
        let row = sqlx::query_as::<_, DbPicture>("SELECT * FROM pathology_pictures WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(row.map(PathologyPicture::from))
    }

    async fn pictures_for_patient(&self, patient_id: i64) -> Result<Vec<PathologyPicture>> {
        let rows = sqlx::query_as::<_, DbPicture>(
            "SELECT * FROM pathology_pictures WHERE patient_id = $1 ORDER BY created_at, id",
        )
        .bind(patient_id)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows.into_iter().map(PathologyPicture::from).collect())
    }

    async fn mark_picture_cutted(&self, id: i64) -> Result<bool> {
        let pool = self.pool.pool();
        let result = sqlx::query(
            "UPDATE pathology_pictures SET is_cutted = TRUE WHERE id = $1 AND is_cutted = FALSE",
        )
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // 没有更新：要么已经切过，要么不存在
        match self.get_picture(id).await? {
            Some(_) => Ok(false),
            None => Err(PathoError::not_found("picture", id)),
        }
    }

    async fn delete_picture(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM pathology_pictures WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_write_error(e, &format!("picture {} is referenced by a diagnosis", id)))?;

        if result.rows_affected() == 0 {
            return Err(PathoError::not_found("picture", id));
        }
        Ok(())
    }

    // ========== 诊断相关操作 ==========

    async fn insert_diagnosis(&self, diagnosis: &NewDiagnosis) -> Result<Diagnosis> {
        let row = sqlx::query_as::<_, DbDiagnosis>(
            r#"
            INSERT INTO diagnoses (picture_id, high, medium, low, advice, doctor_advice, created_at, last_update)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *
        "#,
        )
        .bind(diagnosis.picture_id)
        .bind(diagnosis.high)
        .bind(diagnosis.medium)
        .bind(diagnosis.low)
        .bind(&diagnosis.advice)
        .bind(&diagnosis.doctor_advice)
        .bind(diagnosis.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| match map_write_error(e, "insert diagnosis") {
            PathoError::ReferentialIntegrity(_) => {
                PathoError::not_found("picture", diagnosis.picture_id)
            }
            other => other,
        })?;

        Ok(Diagnosis::from(row))
    }

    async fn get_diagnosis(&self, id: i64) -> Result<Option<Diagnosis>> {
        let row = sqlx::query_as::<_, DbDiagnosis>("SELECT * FROM diagnoses WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(row.map(Diagnosis::from))
    }

    async fn update_diagnosis(
        &self,
        diagnosis: &Diagnosis,
        expected_last_update: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE diagnoses
            SET region_picture = $1, high = $2, medium = $3, low = $4,
                advice = $5, doctor_advice = $6, is_finished = $7, last_update = $8
            WHERE id = $9 AND last_update = $10
        "#,
        )
        .bind(&diagnosis.region_picture)
        .bind(diagnosis.high)
        .bind(diagnosis.medium)
        .bind(diagnosis.low)
        .bind(&diagnosis.advice)
        .bind(&diagnosis.doctor_advice)
        .bind(diagnosis.is_finished)
        .bind(diagnosis.last_update)
        .bind(diagnosis.id)
        .bind(expected_last_update)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_diagnosis(diagnosis.id).await? {
            Some(current) => Err(PathoError::Conflict(format!(
                "diagnosis {} was modified at {}",
                diagnosis.id, current.last_update
            ))),
            None => Err(PathoError::not_found("diagnosis", diagnosis.id)),
        }
    }

    async fn list_diagnoses(&self, filter: &DiagnosisFilter) -> Result<Page<Diagnosis>> {
        let pool = self.pool.pool();
        const WHERE: &str = r#"
            WHERE ($1::boolean IS NULL OR d.is_finished = $1)
              AND ($2::uuid IS NULL OR EXISTS (
                    SELECT 1 FROM diagnosis_assignments a
                    WHERE a.diagnosis_id = d.id AND a.clinician_id = $2))
        "#;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM diagnoses d {}", WHERE))
            .bind(filter.is_finished)
            .bind(filter.assigned_to)
            .fetch_one(pool)
            .await?
            .get("total");

        let rows = sqlx::query_as::<_, DbDiagnosis>(&format!(
            "SELECT d.* FROM diagnoses d {} ORDER BY d.id LIMIT $3 OFFSET $4",
            WHERE
        ))
        .bind(filter.is_finished)
        .bind(filter.assigned_to)
        .bind(bigint("limit", filter.limit)?)
        .bind(bigint("offset", filter.offset)?)
        .fetch_all(pool)
        .await?;

        Ok(Page {
            total: total as usize,
            offset: filter.offset,
            limit: filter.limit,
            items: rows.into_iter().map(Diagnosis::from).collect(),
        })
    }

    // ========== 分配相关操作 ==========

    async fn assign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO diagnosis_assignments (diagnosis_id, clinician_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(diagnosis_id)
        .bind(clinician_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| match map_write_error(e, "assign clinician") {
            PathoError::ReferentialIntegrity(_) => PathoError::not_found("diagnosis", diagnosis_id),
            other => other,
        })?;
        Ok(())
    }

    async fn unassign_clinician(&self, diagnosis_id: i64, clinician_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM diagnosis_assignments WHERE diagnosis_id = $1 AND clinician_id = $2",
        )
        .bind(diagnosis_id)
        .bind(clinician_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assignees(&self, diagnosis_id: i64) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT clinician_id FROM diagnosis_assignments WHERE diagnosis_id = $1 ORDER BY clinician_id",
        )
        .bind(diagnosis_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.iter().map(|row| row.get("clinician_id")).collect())
    }

    // ========== 标注相关操作 ==========

    async fn insert_label(&self, label: &LabelItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO label_items (id, diagnosis_id, category, x, y, w, h, zoom_level,
                                     confidence, author, region_picture, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
        )
        .bind(label.id)
        .bind(label.diagnosis_id)
        .bind(label.category.code())
        .bind(label.x)
        .bind(label.y)
        .bind(label.w)
        .bind(label.h)
        .bind(label.zoom_level)
        .bind(label.confidence)
        .bind(label.author)
        .bind(&label.region_picture)
        .bind(label.created_at)
        .bind(label.modified_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| match map_write_error(e, "insert label") {
            PathoError::ReferentialIntegrity(_) => {
                PathoError::not_found("diagnosis", label.diagnosis_id)
            }
            other => other,
        })?;
        Ok(())
    }

    async fn labels_for_diagnosis(&self, diagnosis_id: i64) -> Result<Vec<LabelItem>> {
        let rows = sqlx::query_as::<_, DbLabelItem>(
            "SELECT * FROM label_items WHERE diagnosis_id = $1 ORDER BY created_at, id",
        )
        .bind(diagnosis_id)
        .fetch_all(self.pool.pool())
        .await?;

        rows.into_iter().map(LabelItem::try_from).collect()
    }
}
