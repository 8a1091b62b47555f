//! Weighted score fusion
//!
//! `overall = Σ(weight[d] * similarity[d]) / Σ(weight[d])`, summed over the
//! detectors that actually produced a result. Skipped or failed detectors
//! contribute to neither sum, and neither does a non-finite similarity.

use crate::detectors::{DetectorKind, DetectorStats};
use crate::models::preset::DEFAULT_WEIGHT;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusedScore {
    pub overall: f64,
    pub meets_threshold: bool,
    /// False when nothing could be compared ("no comparable data"), which is
    /// distinct from "compared but dissimilar"
    pub comparable: bool,
}

impl FusedScore {
    pub fn no_comparable_data() -> Self {
        Self {
            overall: 0.0,
            meets_threshold: false,
            comparable: false,
        }
    }
}

/// Fuse the results of the detectors that ran
pub fn fuse(
    ran: &BTreeMap<DetectorKind, DetectorStats>,
    weights: &BTreeMap<DetectorKind, f64>,
    similarity_threshold: f64,
) -> FusedScore {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut counted = 0usize;
    for (kind, stats) in ran {
        if !stats.similarity.is_finite() {
            continue;
        }
        let weight = weights.get(kind).copied().unwrap_or(DEFAULT_WEIGHT);
        numerator += weight * stats.similarity.clamp(0.0, 1.0);
        denominator += weight;
        counted += 1;
    }

    if counted == 0 || denominator <= 0.0 {
        return FusedScore::no_comparable_data();
    }

    let overall = (numerator / denominator).clamp(0.0, 1.0);
    FusedScore {
        overall,
        meets_threshold: overall >= similarity_threshold,
        comparable: true,
    }
}
