//! 字段校验
//!
//! 所有输入在进入存储层之前校验，错误按字段收集后一次性返回。

use crate::error::{Result, ValidationErrors};
use crate::labels::{LabelCategory, LabelInput, NewLabel};
use crate::models::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const NAME_MAX_LEN: usize = 255;
pub const DESCRIPTION_MAX_LEN: usize = 10_000;
pub const ADVICE_MAX_LEN: usize = 20_000;
pub const AGE_MAX: i64 = 32_767;
pub const DEFAULT_SCORE: f64 = 1.0;
pub const DEFAULT_ZOOM_LEVEL: f64 = 10.0;
pub const DEFAULT_CONFIDENCE: f64 = 1.0;

fn check_name(errors: &mut ValidationErrors, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        errors.add("name", "must not be empty");
    } else if name.chars().count() > NAME_MAX_LEN {
        errors.add("name", format!("must be at most {} characters", NAME_MAX_LEN));
    }
    name.to_string()
}

fn check_sex(errors: &mut ValidationErrors, sex: &str) -> Option<Sex> {
    match sex.parse::<Sex>() {
        Ok(sex) => Some(sex),
        Err(e) => {
            errors.add("sex", e);
            None
        }
    }
}

fn check_age(errors: &mut ValidationErrors, age: Option<i64>) -> Option<u16> {
    match age {
        None => None,
        Some(a) if a < 0 => {
            errors.add("age", "must not be negative");
            None
        }
        Some(a) if a > AGE_MAX => {
            errors.add("age", format!("must be at most {}", AGE_MAX));
            None
        }
        Some(a) => Some(a as u16),
    }
}

fn check_text(errors: &mut ValidationErrors, field: &str, text: &str, max: usize) {
    if text.chars().count() > max {
        errors.add(field, format!("must be at most {} characters", max));
    }
}

/// 分数必须是 [0, 1] 内的有限值；三者之和不做约束
pub fn check_score(errors: &mut ValidationErrors, field: &str, value: f64) {
    if !value.is_finite() {
        errors.add(field, "must be a finite number");
    } else if !(0.0..=1.0).contains(&value) {
        errors.add(field, "must be between 0 and 1");
    }
}

pub fn validate_description(description: &str) -> Result<()> {
    let mut errors = ValidationErrors::new();
    check_text(&mut errors, "description", description, DESCRIPTION_MAX_LEN);
    errors.into_result()
}

impl PatientInput {
    pub fn validate(&self) -> Result<NewPatient> {
        let mut errors = ValidationErrors::new();
        let name = check_name(&mut errors, &self.name);
        let sex = check_sex(&mut errors, &self.sex);
        let age = check_age(&mut errors, self.age);
        errors.into_result()?;

        Ok(NewPatient {
            name,
            // 没有错误时 sex 一定解析成功
            sex: sex.unwrap_or(Sex::Other),
            age,
        })
    }
}

impl PatientUpdate {
    /// 在现有患者上应用更新并返回新值
    pub fn validate_against(&self, existing: &Patient) -> Result<Patient> {
        let mut errors = ValidationErrors::new();
        let mut updated = existing.clone();

        if let Some(name) = &self.name {
            updated.name = check_name(&mut errors, name);
        }
        if let Some(sex) = &self.sex {
            if let Some(sex) = check_sex(&mut errors, sex) {
                updated.sex = sex;
            }
        }
        if self.age.is_some() {
            updated.age = check_age(&mut errors, self.age);
        }

        errors.into_result()?;
        Ok(updated)
    }
}

impl DiagnosisInput {
    pub fn validate(&self, created_at: DateTime<Utc>) -> Result<NewDiagnosis> {
        let mut errors = ValidationErrors::new();
        if self.picture_id <= 0 {
            errors.add("picture_id", "must be a positive id");
        }

        let high = self.high.unwrap_or(DEFAULT_SCORE);
        let medium = self.medium.unwrap_or(DEFAULT_SCORE);
        let low = self.low.unwrap_or(DEFAULT_SCORE);
        check_score(&mut errors, "high", high);
        check_score(&mut errors, "medium", medium);
        check_score(&mut errors, "low", low);

        let advice = self.advice.clone().unwrap_or_default();
        let doctor_advice = self.doctor_advice.clone().unwrap_or_default();
        check_text(&mut errors, "advice", &advice, ADVICE_MAX_LEN);
        check_text(&mut errors, "doctor_advice", &doctor_advice, ADVICE_MAX_LEN);
        errors.into_result()?;

        Ok(NewDiagnosis {
            picture_id: self.picture_id,
            high,
            medium,
            low,
            advice,
            doctor_advice,
            created_at,
        })
    }
}

impl DiagnosisPatch {
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if let Some(advice) = &self.advice {
            check_text(&mut errors, "advice", advice, ADVICE_MAX_LEN);
        }
        if let Some(doctor_advice) = &self.doctor_advice {
            check_text(&mut errors, "doctor_advice", doctor_advice, ADVICE_MAX_LEN);
        }
        for (field, value) in [("high", self.high), ("medium", self.medium), ("low", self.low)] {
            if let Some(v) = value {
                check_score(&mut errors, field, v);
            }
        }
        errors.into_result()
    }
}

impl LabelInput {
    pub fn validate(&self, diagnosis_id: i64, author: Uuid) -> Result<NewLabel> {
        let mut errors = ValidationErrors::new();

        let category = match &self.category {
            None => LabelCategory::default(),
            Some(code) => match code.parse::<LabelCategory>() {
                Ok(c) => c,
                Err(e) => {
                    errors.add("category", e);
                    LabelCategory::default()
                }
            },
        };

        for (field, value) in [("x", self.x), ("y", self.y)] {
            if !value.is_finite() || value < 0.0 {
                errors.add(field, "must be a non-negative finite number");
            }
        }
        for (field, value) in [("w", self.w), ("h", self.h)] {
            if !value.is_finite() || value <= 0.0 {
                errors.add(field, "must be a positive finite number");
            }
        }

        let zoom_level = self.zoom_level.unwrap_or(DEFAULT_ZOOM_LEVEL);
        if !zoom_level.is_finite() || zoom_level <= 0.0 {
            errors.add("zoom_level", "must be a positive finite number");
        }
        let confidence = self.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        check_score(&mut errors, "confidence", confidence);

        errors.into_result()?;
        Ok(NewLabel {
            diagnosis_id,
            category,
            x: self.x,
            y: self.y,
            w: self.w,
            h: self.h,
            zoom_level,
            confidence,
            author,
        })
    }
}
