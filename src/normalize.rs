//! Second pass: min-max normalization of raw values into `[0, 1]` scores,
//! recomputed over every row of one attribute.

use serde::Serialize;
use tracing::{info, warn};

use crate::attributes::{
    CityAttributeName, InsufficientData, NormalizationPolicy, UnusableScore,
};
use crate::errors::AppResult;
use crate::store::{AttributeRow, AttributeStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizationOutcome {
    /// Scores were rescaled against the observed range of transformed values.
    Applied {
        usable: usize,
        updated: usize,
        min: f64,
        max: f64,
    },
    /// Fewer than two usable rows; scores left as they were.
    Abstained { usable: usize },
    /// Fewer than two usable rows; every score forced to zero.
    ForcedZero { usable: usize, updated: usize },
}

/// New scores for the rows that change, keyed by row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationPlan {
    pub scores: Vec<(i64, f64)>,
    pub outcome: NormalizationOutcome,
}

pub fn plan(rows: &[AttributeRow], policy: &NormalizationPolicy) -> NormalizationPlan {
    let usable_value = |row: &AttributeRow| {
        row.raw_value
            .filter(|_| policy.usable.accepts(row.raw_value))
            .map(|value| policy.transform.apply(value))
            .filter(|value| value.is_finite())
    };

    let values: Vec<f64> = rows.iter().filter_map(usable_value).collect();
    let usable = values.len();

    if usable < 2 {
        return match policy.insufficient {
            InsufficientData::Abstain => NormalizationPlan {
                scores: Vec::new(),
                outcome: NormalizationOutcome::Abstained { usable },
            },
            InsufficientData::ForceZero => {
                let scores: Vec<(i64, f64)> = rows.iter().map(|row| (row.id, 0.0)).collect();
                NormalizationPlan {
                    outcome: NormalizationOutcome::ForcedZero {
                        usable,
                        updated: scores.len(),
                    },
                    scores,
                }
            }
        };
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;

    let mut scores = Vec::with_capacity(rows.len());
    for row in rows {
        let score = match usable_value(row) {
            Some(_) if span <= 0.0 => 0.5,
            Some(value) => {
                let scaled = ((value - min) / span).clamp(0.0, 1.0);
                if policy.lower_is_better {
                    1.0 - scaled
                } else {
                    scaled
                }
            }
            None => match policy.unusable {
                UnusableScore::Unchanged => continue,
                UnusableScore::Zero => 0.0,
            },
        };
        scores.push((row.id, score));
    }

    NormalizationPlan {
        outcome: NormalizationOutcome::Applied {
            usable,
            updated: scores.len(),
            min,
            max,
        },
        scores,
    }
}

/// Recomputes every normalized score for `attribute` and commits them in one
/// transaction.
pub fn normalize_attribute(
    store: &AttributeStore,
    attribute: CityAttributeName,
) -> AppResult<NormalizationOutcome> {
    let policy = attribute.normalization_policy();
    let rows = store.attribute_rows(attribute)?;
    let plan = plan(&rows, &policy);

    match &plan.outcome {
        NormalizationOutcome::Applied { min, max, .. } => {
            if min == max {
                info!(
                    attribute = attribute.as_str(),
                    value = *min,
                    "all usable values are equal; scoring them 0.5"
                );
            } else {
                info!(
                    attribute = attribute.as_str(),
                    min = *min,
                    max = *max,
                    transform = ?policy.transform,
                    "normalizing against observed range"
                );
            }
        }
        NormalizationOutcome::Abstained { usable } => {
            warn!(
                attribute = attribute.as_str(),
                usable = *usable,
                "not enough usable raw values to normalize; at least 2 are required"
            );
        }
        NormalizationOutcome::ForcedZero { usable, .. } => {
            warn!(
                attribute = attribute.as_str(),
                usable = *usable,
                "not enough usable raw values to normalize; forcing every score to 0"
            );
        }
    }

    if !plan.scores.is_empty() {
        let written = store.write_normalized_scores(&plan.scores)?;
        info!(
            attribute = attribute.as_str(),
            rows = written,
            "normalized scores committed"
        );
    }
    Ok(plan.outcome)
}
