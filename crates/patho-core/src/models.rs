//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 患者基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub name: String,
    pub sex: Sex,
    pub age: Option<u16>,
}

/// 性别枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "O")]
    Other,
}

impl Sex {
    pub fn code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }

    /// 报告中显示的文字
    pub fn label(&self) -> &'static str {
        match self {
            Sex::Male => "男",
            Sex::Female => "女",
            Sex::Other => "其他",
        }
    }
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "male" | "男" => Ok(Sex::Male),
            "f" | "female" | "女" => Ok(Sex::Female),
            "o" | "other" | "其他" => Ok(Sex::Other),
            other => Err(format!("unknown sex '{}'", other)),
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 病理切片图片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathologyPicture {
    pub id: i64,
    pub patient_id: i64,
    /// 存储根目录下的相对路径
    pub file: String,
    pub description: String,
    /// 上传内容的 SHA-256
    pub checksum: String,
    /// 是否已经切图
    pub is_cutted: bool,
    pub created_at: DateTime<Utc>,
}

/// 诊断
///
/// 每个诊断恰好引用一张病理图片；被引用的图片不能删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: i64,
    pub picture_id: i64,
    /// 分子标记物表达图（感兴趣区域）
    pub region_picture: Option<String>,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    /// 智能分析意见
    pub advice: String,
    /// 医生肉眼所见
    pub doctor_advice: String,
    pub is_finished: bool,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// 已认证的医生
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clinician {
    pub id: Uuid,
    pub username: String,
    pub name: String,
}

/// 请求方身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Clinician(Clinician),
}

impl Identity {
    pub fn clinician_id(&self) -> Option<Uuid> {
        match self {
            Identity::Anonymous => None,
            Identity::Clinician(c) => Some(c.id),
        }
    }
}

// 输入模型 - 来自调用方，尚未校验

/// 新建患者请求
#[derive(Debug, Clone, Deserialize)]
pub struct PatientInput {
    pub name: String,
    pub sex: String,
    #[serde(default)]
    pub age: Option<i64>,
}

/// 患者部分更新请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatientUpdate {
    pub name: Option<String>,
    pub sex: Option<String>,
    pub age: Option<i64>,
}

/// 新建诊断请求
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosisInput {
    pub picture_id: i64,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub medium: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub advice: Option<String>,
    #[serde(default)]
    pub doctor_advice: Option<String>,
}

/// 诊断部分更新请求
///
/// 只允许修改意见、分数和完成标记；标识和关联字段一律拒绝。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosisPatch {
    pub advice: Option<String>,
    pub doctor_advice: Option<String>,
    pub high: Option<f64>,
    pub medium: Option<f64>,
    pub low: Option<f64>,
    #[serde(rename = "isFinished", alias = "is_finished")]
    pub is_finished: Option<bool>,
    /// 乐观并发：调用方读到的 last_update
    pub expected_last_update: Option<DateTime<Utc>>,
}

impl DiagnosisPatch {
    /// 把补丁写入诊断，返回是否真的有字段发生变化
    pub fn apply_to(&self, diagnosis: &mut Diagnosis) -> bool {
        let mut changed = false;

        if let Some(advice) = &self.advice {
            if *advice != diagnosis.advice {
                diagnosis.advice = advice.clone();
                changed = true;
            }
        }
        if let Some(doctor_advice) = &self.doctor_advice {
            if *doctor_advice != diagnosis.doctor_advice {
                diagnosis.doctor_advice = doctor_advice.clone();
                changed = true;
            }
        }
        for (value, slot) in [
            (self.high, &mut diagnosis.high),
            (self.medium, &mut diagnosis.medium),
            (self.low, &mut diagnosis.low),
        ] {
            if let Some(v) = value {
                if v != *slot {
                    *slot = v;
                    changed = true;
                }
            }
        }
        if let Some(finished) = self.is_finished {
            if finished != diagnosis.is_finished {
                diagnosis.is_finished = finished;
                changed = true;
            }
        }

        changed
    }
}

// 插入模型 - 已校验，可以交给存储层

#[derive(Debug, Clone, PartialEq)]
pub struct NewPatient {
    pub name: String,
    pub sex: Sex,
    pub age: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPicture {
    pub patient_id: i64,
    pub file: String,
    pub description: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDiagnosis {
    pub picture_id: i64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub advice: String,
    pub doctor_advice: String,
    pub created_at: DateTime<Utc>,
}
