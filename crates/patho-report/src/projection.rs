//! 报告上下文
//!
//! 把诊断、患者、图片和阳性发现投影成模板可用的键值。

use chrono::{DateTime, FixedOffset, Utc};
use image::{ImageFormat, ImageReader};
use patho_core::{Diagnosis, FindingsReport, LabelCategory, PathoError, Patient, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;

pub const CHECKED: &str = "☑";
pub const UNCHECKED: &str = "☐";

/// 图片尺寸规则
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSizing {
    pub width_mm: f64,
    pub max_height_mm: f64,
}

impl Default for ImageSizing {
    fn default() -> Self {
        Self {
            width_mm: 60.0,
            max_height_mm: 60.0,
        }
    }
}

impl ImageSizing {
    /// 按目标宽度等比缩放，高度超限时改为按最大高度缩放
    pub fn fit(&self, width_px: u32, height_px: u32) -> Result<(f64, f64)> {
        if width_px == 0 || height_px == 0 {
            return Err(PathoError::Image(format!(
                "image has empty dimensions {}x{}",
                width_px, height_px
            )));
        }
        let ratio = f64::from(height_px) / f64::from(width_px);
        let height = self.width_mm * ratio;
        if height > self.max_height_mm {
            Ok((self.max_height_mm / ratio, self.max_height_mm))
        } else {
            Ok((self.width_mm, height))
        }
    }
}

/// 内嵌图片
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    /// 媒体文件扩展名
    pub extension: &'static str,
    pub content_type: &'static str,
    pub width_px: u32,
    pub height_px: u32,
    pub width_mm: f64,
    pub height_mm: f64,
}

impl InlineImage {
    /// 只解析图像头获取像素尺寸，图片数据原样嵌入
    pub fn from_bytes(bytes: Vec<u8>, sizing: &ImageSizing) -> Result<Self> {
        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| PathoError::Image(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| PathoError::Image("unrecognised image format".to_string()))?;
        let (extension, content_type) = match format {
            ImageFormat::Png => ("png", "image/png"),
            ImageFormat::Jpeg => ("jpeg", "image/jpeg"),
            ImageFormat::Tiff => ("tiff", "image/tiff"),
            other => {
                return Err(PathoError::Image(format!(
                    "unsupported image format {:?}",
                    other
                )))
            }
        };

        let (width_px, height_px) = reader
            .into_dimensions()
            .map_err(|e| PathoError::Image(e.to_string()))?;
        let (width_mm, height_mm) = sizing.fit(width_px, height_px)?;

        Ok(Self {
            bytes,
            extension,
            content_type,
            width_px,
            height_px,
            width_mm,
            height_mm,
        })
    }
}

/// 模板中的一个值
#[derive(Debug, Clone, PartialEq)]
pub enum ReportValue {
    Text(String),
    Image(InlineImage),
}

/// 模板上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportContext {
    values: BTreeMap<String, ReportValue>,
}

impl ReportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(&mut self, key: &str, value: impl Into<String>) {
        self.values
            .insert(key.to_string(), ReportValue::Text(value.into()));
    }

    pub fn insert_image(&mut self, key: &str, image: InlineImage) {
        self.values.insert(key.to_string(), ReportValue::Image(image));
    }

    pub fn get(&self, key: &str) -> Option<&ReportValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ReportValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// 由诊断数据构建上下文；没有区域图时 `regionPicture` 为空文本。
    /// 日期按 `display_offset` 所在时区显示。
    pub fn project(
        patient: &Patient,
        diagnosis: &Diagnosis,
        findings: &FindingsReport,
        pathology_picture: InlineImage,
        region_picture: Option<InlineImage>,
        report_date: DateTime<Utc>,
        display_offset: FixedOffset,
    ) -> Self {
        let mut ctx = Self::new();

        ctx.insert_text("doctor_advice", diagnosis.doctor_advice.as_str());
        ctx.insert_text("high", diagnosis.high.to_string());
        ctx.insert_text("medium", diagnosis.medium.to_string());
        ctx.insert_text("low", diagnosis.low.to_string());
        ctx.insert_text("advice", diagnosis.advice.as_str());
        ctx.insert_image("pathologyPicture", pathology_picture);
        match region_picture {
            Some(image) => ctx.insert_image("regionPicture", image),
            None => ctx.insert_text("regionPicture", ""),
        }

        ctx.insert_text("patient_name", patient.name.as_str());
        ctx.insert_text("patient_sex", patient.sex.label());
        ctx.insert_text(
            "patient_age",
            patient.age.map(|a| a.to_string()).unwrap_or_default(),
        );
        ctx.insert_text(
            "created_at",
            diagnosis
                .created_at
                .with_timezone(&display_offset)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
        );
        ctx.insert_text(
            "report_date",
            report_date
                .with_timezone(&display_offset)
                .format("%Y-%m-%d")
                .to_string(),
        );

        for category in LabelCategory::ALL {
            let mark = if findings.contains(category) {
                CHECKED
            } else {
                UNCHECKED
            };
            ctx.insert_text(&format!("finding_{}", category.field_key()), mark);
        }
        // 其他恶性肿瘤没有对应的标注分类
        ctx.insert_text("finding_OTHER", UNCHECKED);

        ctx
    }
}
