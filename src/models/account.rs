use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::Points;

/// School year of the learner. Carried for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GradeLevel {
    #[serde(rename = "JH1st")]
    JuniorHigh1,
    #[default]
    #[serde(rename = "JH2nd")]
    JuniorHigh2,
    #[serde(rename = "JH3rd")]
    JuniorHigh3,
    #[serde(rename = "SH1st")]
    SeniorHigh1,
    #[serde(rename = "SH2nd")]
    SeniorHigh2,
    #[serde(rename = "SH3rd")]
    SeniorHigh3,
}

impl GradeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeLevel::JuniorHigh1 => "JH1st",
            GradeLevel::JuniorHigh2 => "JH2nd",
            GradeLevel::JuniorHigh3 => "JH3rd",
            GradeLevel::SeniorHigh1 => "SH1st",
            GradeLevel::SeniorHigh2 => "SH2nd",
            GradeLevel::SeniorHigh3 => "SH3rd",
        }
    }
}

impl std::str::FromStr for GradeLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JH1st" => Ok(GradeLevel::JuniorHigh1),
            "JH2nd" => Ok(GradeLevel::JuniorHigh2),
            "JH3rd" => Ok(GradeLevel::JuniorHigh3),
            "SH1st" => Ok(GradeLevel::SeniorHigh1),
            "SH2nd" => Ok(GradeLevel::SeniorHigh2),
            "SH3rd" => Ok(GradeLevel::SeniorHigh3),
            _ => Err(format!("Unknown grade level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub display_name: String,
    pub grade_level: GradeLevel,
    pub timezone: Tz,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAccountRequest {
    pub display_name: String,
    #[serde(default)]
    pub grade_level: GradeLevel,
    pub timezone: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub user_id: String,
    pub display_name: String,
    pub grade_level: GradeLevel,
    pub timezone: String,
    pub points: Points,
    pub created_at: DateTime<Utc>,
}
