//! Score rounding and aggregate statistics over feedback.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ExperimentResultRow;

/// Decimal places kept by the built-in summary evaluators.
pub const SUMMARY_PRECISION: u32 = 3;

/// Round to `places` decimal places, halves away from zero.
///
/// `round_to(2.0 / 3.0, 3) == 0.667`.
pub fn round_to(value: f64, places: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Arithmetic mean, or `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Aggregate of all row-level results sharing one feedback key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub key: String,
    /// Number of results with this key.
    pub count: usize,
    /// Number of those results carrying a numeric score.
    pub scored: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Aggregate row-level evaluation results per key, ordered by key.
pub fn feedback_stats(rows: &[ExperimentResultRow]) -> Vec<FeedbackStats> {
    let mut by_key: BTreeMap<&str, (usize, Vec<f64>)> = BTreeMap::new();
    for result in rows.iter().flat_map(|row| row.evaluation_results.iter()) {
        let entry = by_key.entry(result.key.as_str()).or_default();
        entry.0 += 1;
        if let Some(score) = result.score {
            entry.1.push(score);
        }
    }

    by_key
        .into_iter()
        .map(|(key, (count, scores))| FeedbackStats {
            key: key.to_string(),
            count,
            scored: scores.len(),
            mean: mean(&scores).map(|m| round_to(m, SUMMARY_PRECISION)),
            min: scores.iter().copied().reduce(f64::min),
            max: scores.iter().copied().reduce(f64::max),
        })
        .collect()
}
