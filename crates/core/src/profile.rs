//! Client-side investor profile scoring.
//!
//! The backend normally returns a profile with the final advice payload;
//! this module recomputes an equivalent one from the response log so a
//! session that finishes without a server profile still renders a result.
//! All weights are empirical and start from a neutral 50 on every axis.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::question::{QuestionType, ResponseRecord};

/// Five 0–100 behavioral scores describing an investor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestorProfile {
    pub risk: u8,
    pub stability: u8,
    pub confidence: u8,
    pub patience: u8,
    pub sensitivity: u8,
}

static AGGRESSIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"加碼|買入|進場|冒險").expect("valid regex"));
static DEFENSIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"賣出|逃離|恐慌|立刻賣出|減碼").expect("valid regex"));
static PATIENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"觀望|冷靜|等待|持有").expect("valid regex"));

fn clamp_score(value: f32) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Derives a profile from the accepted answers of one session.
pub fn compute_profile(responses: &[ResponseRecord]) -> InvestorProfile {
    let mut risk = 50.0_f32;
    let mut stability = 50.0_f32;
    let mut confidence = 50.0_f32;
    let mut patience = 50.0_f32;
    let mut sensitivity = 50.0_f32;

    for response in responses {
        match response.question_type {
            QuestionType::Likert => {
                if let Some(value) = response.value {
                    let v = value as f32;
                    risk += (v - 3.0) * 8.0;
                    stability += (3.0 - v) * 6.0;
                    confidence += (v - 3.0) * 6.0;
                    patience += (v - 3.0) * 4.0;
                    sensitivity += (3.0 - v) * 6.0;
                }
            }
            QuestionType::SingleChoice => {
                if AGGRESSIVE.is_match(&response.answer) {
                    risk += 12.0;
                    confidence += 8.0;
                    sensitivity += 6.0;
                } else if DEFENSIVE.is_match(&response.answer) {
                    risk -= 12.0;
                    stability -= 8.0;
                    sensitivity += 10.0;
                } else if PATIENT.is_match(&response.answer) {
                    stability += 10.0;
                    patience += 8.0;
                    risk -= 4.0;
                } else if let Some(index) = response.value {
                    // Unknown vocabulary: lean on the option's position in
                    // the list as a weak aggressiveness signal.
                    let v = index as f32;
                    let pos_factor = v / (v - 1.0).max(1.0) - 0.5;
                    risk += pos_factor * 16.0;
                    confidence += pos_factor * 10.0;
                    sensitivity -= pos_factor * 6.0;
                }
            }
            QuestionType::Open => {
                // Long written answers read as considered and confident.
                if response.answer.chars().count() > 80 {
                    confidence += 6.0;
                    patience += 4.0;
                }
            }
        }
    }

    InvestorProfile {
        risk: clamp_score(risk),
        stability: clamp_score(stability),
        confidence: clamp_score(confidence),
        patience: clamp_score(patience),
        sensitivity: clamp_score(sensitivity),
    }
}

/// Maps a profile onto one of the five investor archetypes.
pub fn classify_investor(profile: &InvestorProfile) -> &'static str {
    if profile.risk > 60 && profile.stability < 40 {
        "波動型（情緒受市場影響）"
    } else if profile.risk > 60 {
        "探險型（高風險偏好）"
    } else if profile.risk <= 40 && profile.stability >= 60 {
        "冷靜型（理性決策）"
    } else if profile.risk <= 40 {
        "謹慎型（保守穩健）"
    } else {
        "綜合型（中庸平衡）"
    }
}
