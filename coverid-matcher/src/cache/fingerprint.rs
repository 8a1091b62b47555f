//! Content fingerprints and cache key construction
//!
//! Key layout: `{namespace}/{detector}/{prep}/{sha256-hex}` where `prep` is
//! the image preparation tag (size, plus `c` when cover cropping is on, plus
//! `a` for advanced comparisons). Keeping the detector in the second segment
//! lets operators invalidate one namespace or one detector by prefix.

use crate::detectors::{DetectorKind, PrepareOptions};
use sha2::{Digest, Sha256};

/// Descriptor sets of one image
pub const DESCRIPTOR_NAMESPACE: &str = "desc";
/// Per-detector comparison statistics of one query/candidate pair
pub const COMPARISON_NAMESPACE: &str = "cmp";

/// SHA-256 of image bytes
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Fingerprint for a candidate known only by URL
pub fn url_fingerprint(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"url:");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn descriptor_key(detector: DetectorKind, prep: &PrepareOptions, fingerprint: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        DESCRIPTOR_NAMESPACE,
        detector,
        prep.tag(),
        fingerprint
    )
}

pub fn comparison_key(
    detector: DetectorKind,
    prep: &PrepareOptions,
    advanced: bool,
    query_fingerprint: &str,
    candidate_fingerprint: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(candidate_fingerprint.as_bytes());
    format!(
        "{}/{}/{}{}/{:x}",
        COMPARISON_NAMESPACE,
        detector,
        prep.tag(),
        if advanced { "a" } else { "" },
        hasher.finalize()
    )
}
