//! Confidence scale for AI-generated claims.
//!
//! Scores run from 1 (speculative) to 10 (established). The top band
//! (8–10) is reserved for claims backed by directly cited research.

use serde::{Deserialize, Serialize};

pub const CONFIDENCE_MIN: f64 = 1.0;
pub const CONFIDENCE_MAX: f64 = 10.0;

/// Lowest score that requires at least one citation.
pub const CITED_THRESHOLD: f64 = 8.0;

/// Score an uncited claim is capped to.
pub const UNCITED_CAP: f64 = 7.0;

/// Changes smaller than this are treated as "maintain".
pub const MAINTAIN_TOLERANCE: f64 = 0.5;

/// Clamp a score into [1, 10].
pub fn clamp_confidence(value: f64) -> f64 {
    value.clamp(CONFIDENCE_MIN, CONFIDENCE_MAX)
}

pub fn is_valid_confidence(value: f64) -> bool {
    (CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&value)
}

/// Apply the citation rule. Returns the capped score when the claim sits in
/// the cited band without any citation, `None` when it already complies.
pub fn cap_uncited(confidence: f64, citation_count: usize) -> Option<f64> {
    if confidence >= CITED_THRESHOLD && citation_count == 0 {
        Some(UNCITED_CAP)
    } else {
        None
    }
}

/// Direction of a confidence change relative to a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Maintain,
    Decrease,
}

impl Direction {
    pub fn between(baseline: f64, observed: f64) -> Self {
        let delta = observed - baseline;
        if delta.abs() < MAINTAIN_TOLERANCE {
            Direction::Maintain
        } else if delta > 0.0 {
            Direction::Increase
        } else {
            Direction::Decrease
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Maintain => "maintain",
            Direction::Decrease => "decrease",
        }
    }
}
