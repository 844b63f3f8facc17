//! 诊断报告生成

use crate::naming::{content_disposition, report_filename, DOCX_CONTENT_TYPE};
use crate::projection::{ImageSizing, InlineImage, ReportContext};
use crate::template::DocxTemplate;
use chrono::FixedOffset;
use patho_core::{Clock, PathoError, Result};
use patho_storage::StorageManager;
use patho_workflow::PathologyService;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// 报告设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    pub template_path: PathBuf,
    pub sizing: ImageSizing,
    pub filename_suffix: String,
    /// 报告中日期的显示时区，相对 UTC 的分钟数
    pub utc_offset_minutes: i32,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("assets/report_template.docx"),
            sizing: ImageSizing::default(),
            filename_suffix: "诊断报告.docx".to_string(),
            utc_offset_minutes: 8 * 60,
        }
    }
}

impl ReportSettings {
    pub fn display_offset(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                PathoError::Config(format!(
                    "invalid report utc offset {} minutes",
                    self.utc_offset_minutes
                ))
            })
    }
}

/// 渲染好的报告
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl RenderedReport {
    pub fn content_type(&self) -> &'static str {
        DOCX_CONTENT_TYPE
    }

    pub fn content_disposition(&self) -> String {
        content_disposition(&self.filename)
    }

    pub fn content_length(&self) -> usize {
        self.bytes.len()
    }
}

/// 报告生成器，只读取数据，不修改任何状态
#[derive(Clone)]
pub struct ReportGenerator {
    service: PathologyService,
    storage: StorageManager,
    clock: Arc<dyn Clock>,
    settings: ReportSettings,
}

impl ReportGenerator {
    pub fn new(
        service: PathologyService,
        storage: StorageManager,
        clock: Arc<dyn Clock>,
        settings: ReportSettings,
    ) -> Self {
        Self {
            service,
            storage,
            clock,
            settings,
        }
    }

    pub async fn generate(&self, diagnosis_id: i64) -> Result<RenderedReport> {
        let diagnosis = self.service.get_diagnosis(diagnosis_id).await?;
        let picture = self.service.get_picture(diagnosis.picture_id).await?;
        let patient = self.service.get_patient(picture.patient_id).await?;
        let findings = self.service.findings(diagnosis.id).await?;
        let filename = report_filename(&patient.name, &self.settings.filename_suffix);

        let picture_bytes = self.storage.get_file(&picture.file).await?;
        let region_bytes = match &diagnosis.region_picture {
            Some(region) => Some(self.storage.get_file(region).await?),
            None => None,
        };

        // 每次请求重新加载模板
        let template = DocxTemplate::open(&self.settings.template_path).await?;
        let sizing = self.settings.sizing;
        let display_offset = self.settings.display_offset()?;
        let report_date = self.clock.now();

        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let pathology_picture = InlineImage::from_bytes(picture_bytes, &sizing)?;
            let region_picture = region_bytes
                .map(|bytes| InlineImage::from_bytes(bytes, &sizing))
                .transpose()?;
            let context = ReportContext::project(
                &patient,
                &diagnosis,
                &findings,
                pathology_picture,
                region_picture,
                report_date,
                display_offset,
            );
            template.render(&context)
        })
        .await
        .map_err(|e| PathoError::Internal(format!("report task failed: {}", e)))??;

        tracing::info!(
            diagnosis_id,
            size = bytes.len(),
            "Generated diagnosis report"
        );
        Ok(RenderedReport { filename, bytes })
    }
}
