//! Aggregate statistics for folder/group evaluation sessions

use super::{ImageItem, ItemStage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStats {
    /// Name of the evaluated group (e.g. the folder name)
    pub group: String,
    pub total_images: usize,
    /// Images with at least one match at or above the threshold
    pub successful_matches: usize,
    /// Images compared successfully without any match above the threshold
    pub no_matches: usize,
    /// Images that could not be processed (undecodable, no features)
    pub failed_uploads: usize,
    /// Highest similarity observed across the whole group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_similarity: Option<f64>,
}

impl EvaluationStats {
    pub fn from_items(group: &str, items: &[ImageItem]) -> Self {
        let mut stats = Self {
            group: group.to_string(),
            total_images: items.len(),
            successful_matches: 0,
            no_matches: 0,
            failed_uploads: 0,
            best_similarity: None,
        };

        for item in items {
            match (&item.stage, &item.outcome) {
                (ItemStage::Done, Some(outcome)) if !outcome.is_failure() => {
                    if outcome.match_success {
                        stats.successful_matches += 1;
                    } else {
                        stats.no_matches += 1;
                    }
                    if let Some(best) = outcome.best_similarity {
                        stats.best_similarity =
                            Some(stats.best_similarity.map_or(best, |b| b.max(best)));
                    }
                }
                (ItemStage::Failed, _) | (ItemStage::Done, _) => stats.failed_uploads += 1,
                _ => {}
            }
        }
        stats
    }
}
