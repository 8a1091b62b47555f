//! Per-image processing state and ranked results

use crate::detectors::{DetectorKind, DetectorStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline stage of one query image
///
/// PENDING → EXTRACTING → COMPARING → RANKED → DONE, or FAILED from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStage {
    Pending,
    Extracting,
    Comparing,
    Ranked,
    Done,
    Failed,
}

impl ItemStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStage::Pending => "PENDING",
            ItemStage::Extracting => "EXTRACTING",
            ItemStage::Comparing => "COMPARING",
            ItemStage::Ranked => "RANKED",
            ItemStage::Done => "DONE",
            ItemStage::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ItemStage::Pending),
            "EXTRACTING" => Some(ItemStage::Extracting),
            "COMPARING" => Some(ItemStage::Comparing),
            "RANKED" => Some(ItemStage::Ranked),
            "DONE" => Some(ItemStage::Done),
            "FAILED" => Some(ItemStage::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStage::Done | ItemStage::Failed)
    }
}

/// One (query, candidate) pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Fused similarity, 0.0-1.0
    pub similarity: f64,
    pub meets_threshold: bool,
    /// False when no detector produced a result for this pair
    pub comparable: bool,
    /// Per-detector statistics, failed detectors included as zero records
    pub breakdown: BTreeMap<DetectorKind, DetectorStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_detectors: Vec<DetectorKind>,
}

/// Candidate left out of the ranking, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub candidate_id: String,
    pub reason: String,
}

/// Final result of one query image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// At least one candidate met the threshold
    pub match_success: bool,
    /// Highest similarity over every compared candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_similarity: Option<f64>,
    /// Top matches, best first
    pub matches: Vec<MatchResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedCandidate>,
    /// Candidates compared (ranked list is truncated to the result batch)
    #[serde(default)]
    pub compared_candidates: usize,
    /// Why the image failed, for FAILED items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Rank `matches`, truncate to `result_batch` and derive the summary fields
    pub fn ranked(
        mut matches: Vec<MatchResult>,
        skipped: Vec<SkippedCandidate>,
        result_batch: usize,
    ) -> Self {
        sort_matches(&mut matches);
        let compared_candidates = matches.len();
        let best_similarity = matches.first().map(|m| m.similarity);
        let match_success = matches.iter().any(|m| m.meets_threshold);
        matches.truncate(result_batch);

        Self {
            match_success,
            best_similarity,
            matches,
            skipped,
            compared_candidates,
            error: None,
        }
    }
}

/// Sort by similarity descending, ties broken by candidate id ascending.
/// A NaN similarity ranks below every real score.
pub fn sort_matches(matches: &mut [MatchResult]) {
    fn rank(similarity: f64) -> f64 {
        if similarity.is_nan() {
            f64::NEG_INFINITY
        } else {
            similarity
        }
    }
    matches.sort_by(|a, b| {
        rank(b.similarity)
            .total_cmp(&rank(a.similarity))
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
}

/// One query image within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    pub index: usize,
    pub name: String,
    /// SHA-256 of the image bytes; the descriptor cache is keyed on it
    pub fingerprint: String,
    pub stage: ItemStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ItemOutcome>,
}

impl ImageItem {
    pub fn new(index: usize, name: String, fingerprint: String) -> Self {
        Self {
            index,
            name,
            fingerprint,
            stage: ItemStage::Pending,
            outcome: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, similarity: f64, meets_threshold: bool) -> MatchResult {
        MatchResult {
            candidate_id: id.to_string(),
            url: None,
            similarity,
            meets_threshold,
            comparable: true,
            breakdown: BTreeMap::new(),
            failed_detectors: Vec::new(),
        }
    }

    #[test]
    fn test_sort_descending_with_id_tiebreak() {
        let mut matches = vec![
            result("c", 0.5, false),
            result("b", 0.9, true),
            result("a", 0.5, false),
            result("d", 0.7, true),
        ];
        sort_matches(&mut matches);

        let ids: Vec<_> = matches.iter().map(|m| m.candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
        for pair in matches.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn test_nan_similarities_sort_last() {
        let mut matches: Vec<_> = (0..64)
            .map(|i| {
                let similarity = if i % 3 == 0 { f64::NAN } else { f64::from(i) / 64.0 };
                result(&format!("cand-{:02}", i), similarity, false)
            })
            .collect();
        sort_matches(&mut matches);

        let (scored, unscored) = matches.split_at(42);
        assert!(scored.iter().all(|m| !m.similarity.is_nan()));
        assert!(unscored.iter().all(|m| m.similarity.is_nan()));
        for pair in scored.windows(2) {
            assert!(pair[0].similarity > pair[1].similarity);
        }
        assert_eq!(unscored[0].candidate_id, "cand-00");
        assert_eq!(unscored[21].candidate_id, "cand-63");
    }

    #[test]
    fn test_ranked_truncates_after_summarizing() {
        let outcome = ItemOutcome::ranked(
            vec![
                result("x", 0.2, false),
                result("y", 0.95, true),
                result("z", 0.4, false),
            ],
            vec![SkippedCandidate {
                candidate_id: "w".to_string(),
                reason: "fetch failed".to_string(),
            }],
            1,
        );

        assert!(outcome.match_success);
        assert_eq!(outcome.best_similarity, Some(0.95));
        assert_eq!(outcome.compared_candidates, 3);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].candidate_id, "y");
        assert_eq!(outcome.skipped.len(), 1);
        assert!(!outcome.is_failure());
    }

    #[test]
    fn test_no_candidates_is_unsuccessful_but_not_failed() {
        let outcome = ItemOutcome::ranked(Vec::new(), Vec::new(), 5);
        assert!(!outcome.match_success);
        assert_eq!(outcome.best_similarity, None);
        assert!(!outcome.is_failure());
    }

    #[test]
    fn test_stage_strings() {
        for stage in [
            ItemStage::Pending,
            ItemStage::Extracting,
            ItemStage::Comparing,
            ItemStage::Ranked,
            ItemStage::Done,
            ItemStage::Failed,
        ] {
            assert_eq!(ItemStage::parse(stage.as_str()), Some(stage));
        }
        assert!(ItemStage::Failed.is_terminal());
        assert!(!ItemStage::Ranked.is_terminal());
    }
}
