//! # 诊断报告模块
//!
//! 根据 Word 模板生成诊断报告：
//! - 诊断、患者和阳性发现投影为模板上下文
//! - `{{ name }}` 占位符替换，文本显式转义
//! - 切片图和区域图按 60mm 规则缩放后内嵌
//! - 下载文件名按 URI 路径规则转义

pub mod escape;
pub mod generator;
pub mod naming;
pub mod projection;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;

pub use escape::{escape_xml, text_to_wordml};
pub use generator::{RenderedReport, ReportGenerator, ReportSettings};
pub use naming::{content_disposition, escape_uri_path, report_filename, DOCX_CONTENT_TYPE};
pub use projection::{ImageSizing, InlineImage, ReportContext, ReportValue};
pub use template::DocxTemplate;
