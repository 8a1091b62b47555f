//! Detector adapter layer
//!
//! Uniform interface over independent feature-matching algorithms. Each
//! detector turns a prepared image into a `DescriptorSet` and compares two
//! descriptor sets into a `DetectorStats` triple. Detectors are registered
//! into a `DetectorRegistry` lookup table keyed by `DetectorKind`.
//!
//! Keypoint algorithms (ORB, SIFT, AKAZE, KAZE) come from an external vision
//! library and are registered by the host. Two built-in detectors ship with
//! the crate so the engine works without one:
//! - `grid_hash`: per-tile gradient hashes (see `grid_hash.rs`)
//! - `color_histogram`: per-quadrant color distributions (see `color_histogram.rs`)

pub mod color_histogram;
pub mod grid_hash;
pub mod image_prep;

pub use color_histogram::ColorHistogramDetector;
pub use grid_hash::GridHashDetector;
pub use image_prep::{ImageError, PrepareOptions, PreparedImage};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Closed set of detector names known to the engine
///
/// Configuration referencing any other name is rejected at load time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Orb,
    Sift,
    Akaze,
    Kaze,
    GridHash,
    ColorHistogram,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 6] = [
        DetectorKind::Orb,
        DetectorKind::Sift,
        DetectorKind::Akaze,
        DetectorKind::Kaze,
        DetectorKind::GridHash,
        DetectorKind::ColorHistogram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectorKind::Orb => "orb",
            DetectorKind::Sift => "sift",
            DetectorKind::Akaze => "akaze",
            DetectorKind::Kaze => "kaze",
            DetectorKind::GridHash => "grid_hash",
            DetectorKind::ColorHistogram => "color_histogram",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DetectorError::UnknownDetector(s.to_string()))
    }
}

/// Per-detector match statistic for one (query, candidate) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorStats {
    /// Descriptors that passed the detector's acceptance test
    pub good_matches: u32,
    /// Descriptors considered
    pub total_matches: u32,
    /// Normalized similarity, 0.0-1.0
    pub similarity: f64,
}

impl DetectorStats {
    /// Stats with similarity derived as `good / total` (0.0 when total is 0)
    pub fn from_counts(good_matches: u32, total_matches: u32) -> Self {
        let similarity = if total_matches == 0 {
            0.0
        } else {
            f64::from(good_matches) / f64::from(total_matches)
        };
        Self {
            good_matches,
            total_matches,
            similarity,
        }
    }

    /// Zero-contribution record used for failed detectors
    pub fn zero() -> Self {
        Self {
            good_matches: 0,
            total_matches: 0,
            similarity: 0.0,
        }
    }
}

/// Extracted features of one image for one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub detector: DetectorKind,
    /// Number of keypoints / regions described
    pub keypoints: u32,
    pub data: DescriptorData,
}

/// Descriptor payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DescriptorData {
    /// 64-bit binary descriptors (Hamming space)
    Binary(Vec<u64>),
    /// Normalized histograms, `bins` values per region
    Histogram { bins: usize, values: Vec<f32> },
    /// Opaque fixed-length descriptors produced by an external detector
    Raw { descriptor_len: usize, bytes: Vec<u8> },
}

/// Detector failure, localized to one detector's contribution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectorError {
    /// Enabled in the preset but no implementation registered
    #[error("Detector not available: {0}")]
    Unavailable(DetectorKind),

    #[error("Unknown detector: {0}")]
    UnknownDetector(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Comparison failed: {0}")]
    Comparison(String),

    /// Descriptor sets produced by different detectors or layouts
    #[error("Incompatible descriptors: expected {expected}, found {found}")]
    Incompatible {
        expected: DetectorKind,
        found: DetectorKind,
    },
}

/// Feature detector capability
///
/// Implementations must be side-effect free; they are called from blocking
/// worker threads, possibly concurrently.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Extract descriptors from a prepared image
    fn extract(&self, image: &PreparedImage) -> Result<DescriptorSet, DetectorError>;

    /// Compare query descriptors against candidate descriptors
    ///
    /// `advanced` enables the detector's more tolerant (and slower) matching mode.
    fn compare(
        &self,
        query: &DescriptorSet,
        candidate: &DescriptorSet,
        advanced: bool,
    ) -> Result<DetectorStats, DetectorError>;
}

/// Check both descriptor sets belong to `kind`
pub(crate) fn ensure_kind(
    kind: DetectorKind,
    query: &DescriptorSet,
    candidate: &DescriptorSet,
) -> Result<(), DetectorError> {
    for set in [query, candidate] {
        if set.detector != kind {
            return Err(DetectorError::Incompatible {
                expected: kind,
                found: set.detector,
            });
        }
    }
    Ok(())
}

/// Lookup table of detector implementations
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: HashMap<DetectorKind, Arc<dyn Detector>>,
}

impl DetectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in detectors
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GridHashDetector::default()));
        registry.register(Arc::new(ColorHistogramDetector::default()));
        registry
    }

    /// Register (or replace) the implementation for `detector.kind()`
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        let kind = detector.kind();
        if self.detectors.insert(kind, detector).is_some() {
            tracing::info!(detector = %kind, "Replaced registered detector");
        } else {
            tracing::debug!(detector = %kind, "Registered detector");
        }
    }

    pub fn get(&self, kind: DetectorKind) -> Option<Arc<dyn Detector>> {
        self.detectors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: DetectorKind) -> bool {
        self.detectors.contains_key(&kind)
    }

    /// Registered kinds in stable order
    pub fn kinds(&self) -> Vec<DetectorKind> {
        let mut kinds: Vec<_> = self.detectors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("detectors", &self.kinds())
            .finish()
    }
}
