//! 标注与阳性发现
//!
//! 标注类别限定在固定的临床分类中，赋值时即校验。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 标注类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LabelCategory {
    #[serde(rename = "M")]
    Fungus,
    #[serde(rename = "TR")]
    Trichomonas,
    #[serde(rename = "AM")]
    Actinomyces,
    #[serde(rename = "CL")]
    ClueCell,
    #[serde(rename = "CMV")]
    Cytomegalovirus,
    #[serde(rename = "HSV")]
    HerpesVirus,
    #[serde(rename = "IM")]
    Inflammation,
    #[serde(rename = "S")]
    Atrophy,
    #[serde(rename = "ASC-US")]
    AscUs,
    #[serde(rename = "ASC-H")]
    AscH,
    #[serde(rename = "AGC(NSL)-CC")]
    AgcNslCervical,
    #[serde(rename = "AGC(NSL)-E")]
    AgcNslEndometrial,
    #[serde(rename = "AGC(NSL)-US")]
    AgcNslUnspecified,
    #[serde(rename = "LSIL")]
    Lsil,
    #[serde(rename = "AGC(FN)-CC")]
    AgcFnCervical,
    #[serde(rename = "AGC(FN)-US")]
    AgcFnUnspecified,
    #[serde(rename = "HSIL")]
    Hsil,
    #[serde(rename = "AIS")]
    Ais,
    #[serde(rename = "SCC")]
    Scc,
    #[serde(rename = "GC-CC")]
    AdenocarcinomaCervical,
    #[serde(rename = "GC-E")]
    AdenocarcinomaEndometrial,
    #[serde(rename = "GC-OT")]
    AdenocarcinomaOther,
}

impl LabelCategory {
    pub const ALL: [LabelCategory; 22] = [
        LabelCategory::Fungus,
        LabelCategory::Trichomonas,
        LabelCategory::Actinomyces,
        LabelCategory::ClueCell,
        LabelCategory::Cytomegalovirus,
        LabelCategory::HerpesVirus,
        LabelCategory::Inflammation,
        LabelCategory::Atrophy,
        LabelCategory::AscUs,
        LabelCategory::AscH,
        LabelCategory::AgcNslCervical,
        LabelCategory::AgcNslEndometrial,
        LabelCategory::AgcNslUnspecified,
        LabelCategory::Lsil,
        LabelCategory::AgcFnCervical,
        LabelCategory::AgcFnUnspecified,
        LabelCategory::Hsil,
        LabelCategory::Ais,
        LabelCategory::Scc,
        LabelCategory::AdenocarcinomaCervical,
        LabelCategory::AdenocarcinomaEndometrial,
        LabelCategory::AdenocarcinomaOther,
    ];

    /// 分类代码，也是存储和接口中使用的值
    pub fn code(&self) -> &'static str {
        match self {
            LabelCategory::Fungus => "M",
            LabelCategory::Trichomonas => "TR",
            LabelCategory::Actinomyces => "AM",
            LabelCategory::ClueCell => "CL",
            LabelCategory::Cytomegalovirus => "CMV",
            LabelCategory::HerpesVirus => "HSV",
            LabelCategory::Inflammation => "IM",
            LabelCategory::Atrophy => "S",
            LabelCategory::AscUs => "ASC-US",
            LabelCategory::AscH => "ASC-H",
            LabelCategory::AgcNslCervical => "AGC(NSL)-CC",
            LabelCategory::AgcNslEndometrial => "AGC(NSL)-E",
            LabelCategory::AgcNslUnspecified => "AGC(NSL)-US",
            LabelCategory::Lsil => "LSIL",
            LabelCategory::AgcFnCervical => "AGC(FN)-CC",
            LabelCategory::AgcFnUnspecified => "AGC(FN)-US",
            LabelCategory::Hsil => "HSIL",
            LabelCategory::Ais => "AIS",
            LabelCategory::Scc => "SCC",
            LabelCategory::AdenocarcinomaCervical => "GC-CC",
            LabelCategory::AdenocarcinomaEndometrial => "GC-E",
            LabelCategory::AdenocarcinomaOther => "GC-OT",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            LabelCategory::Fungus => "真菌",
            LabelCategory::Trichomonas => "阴道滴虫",
            LabelCategory::Actinomyces => "放线菌",
            LabelCategory::ClueCell => "线索细胞",
            LabelCategory::Cytomegalovirus => "巨细胞病毒",
            LabelCategory::HerpesVirus => "疱疹病毒",
            LabelCategory::Inflammation => "炎症",
            LabelCategory::Atrophy => "萎缩",
            LabelCategory::AscUs => "非典型鳞状细胞意义不明",
            LabelCategory::AscH => "非典型鳞状细胞不除外上皮高度病",
            LabelCategory::AgcNslCervical => "非典型腺细胞(无具体指向)宫颈管",
            LabelCategory::AgcNslEndometrial => "非典型腺细胞(无具体指向)宫内膜",
            LabelCategory::AgcNslUnspecified => "非典型腺细胞(无具体指向)不能确定来源",
            LabelCategory::Lsil => "鳞状上皮内低度病变",
            LabelCategory::AgcFnCervical => "非典型腺细胞(倾向瘤变)宫颈管",
            LabelCategory::AgcFnUnspecified => "非典型腺细胞(倾向瘤变)不能确定来源",
            LabelCategory::Hsil => "鳞状上皮内高度病变",
            LabelCategory::Ais => "颈管原位癌",
            LabelCategory::Scc => "鳞状细胞癌",
            LabelCategory::AdenocarcinomaCervical => "腺癌宫颈管",
            LabelCategory::AdenocarcinomaEndometrial => "腺癌宫内膜",
            LabelCategory::AdenocarcinomaOther => "腺癌其他",
        }
    }

    /// 模板变量中使用的代码形式，如 `AGC(NSL)-CC` → `AGC_NSL_CC`
    pub fn field_key(&self) -> String {
        let mut key = String::new();
        for c in self.code().chars() {
            match c {
                '(' | '-' => {
                    if !key.ends_with('_') {
                        key.push('_');
                    }
                }
                ')' => {}
                c => key.push(c),
            }
        }
        key
    }
}

impl Default for LabelCategory {
    fn default() -> Self {
        LabelCategory::Fungus
    }
}

impl FromStr for LabelCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        LabelCategory::ALL
            .iter()
            .copied()
            .find(|c| c.code().eq_ignore_ascii_case(code))
            .ok_or_else(|| format!("'{}' is not a known label category", code))
    }
}

impl fmt::Display for LabelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 医生在切片上画的标注框
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelItem {
    pub id: Uuid,
    pub diagnosis_id: i64,
    pub category: LabelCategory,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub zoom_level: f64,
    pub confidence: f64,
    /// 标注医生
    pub author: Uuid,
    pub region_picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// 新建标注请求
#[derive(Debug, Clone, Deserialize)]
pub struct LabelInput {
    #[serde(default)]
    pub category: Option<String>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default, alias = "zoomLevel")]
    pub zoom_level: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLabel {
    pub diagnosis_id: i64,
    pub category: LabelCategory,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub zoom_level: f64,
    pub confidence: f64,
    pub author: Uuid,
}

/// 诊断的阳性发现汇总，每个分类一个勾选项
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FindingsReport {
    pub diagnosis_id: i64,
    pub findings: Vec<LabelCategory>,
    pub label_count: usize,
}

impl FindingsReport {
    pub fn from_labels(diagnosis_id: i64, labels: &[LabelItem]) -> Self {
        let mut findings: Vec<LabelCategory> = labels.iter().map(|l| l.category).collect();
        findings.sort();
        findings.dedup();
        Self {
            diagnosis_id,
            findings,
            label_count: labels.len(),
        }
    }

    pub fn contains(&self, category: LabelCategory) -> bool {
        self.findings.contains(&category)
    }
}
