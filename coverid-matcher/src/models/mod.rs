//! Data models for coverid-matcher

pub mod candidate;
pub mod evaluation;
pub mod image_item;
pub mod preset;
pub mod session;

pub use candidate::{Candidate, CandidateTarget};
pub use evaluation::EvaluationStats;
pub use image_item::{sort_matches, ImageItem, ItemOutcome, ItemStage, MatchResult, SkippedCandidate};
pub use preset::{ConfigPreset, PresetCatalog, PresetOptions};
pub use session::Session;
