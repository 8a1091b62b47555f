//! Matching configuration presets
//!
//! A preset bundles detector enablement, fusion weights, image sizing, worker
//! count and matching options. Exactly one preset is active at a time (its
//! name is the `performance_level`). Sessions copy the preset they were
//! submitted with, so later edits never affect in-flight work.

use crate::detectors::{DetectorKind, PrepareOptions};
use coverid_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIN_IMAGE_SIZE: u32 = 64;
pub const MAX_IMAGE_SIZE: u32 = 4096;
pub const MAX_WORKERS_LIMIT: usize = 64;
/// Weight applied to an enabled detector with no explicit weight
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Name of the preset active on a fresh install
pub const DEFAULT_ACTIVE_PRESET: &str = "balanced";

/// Matching behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresetOptions {
    /// Use each detector's tolerant (slower) comparison mode
    #[serde(default)]
    pub use_advanced_matching: bool,
    /// Crop query and candidate images to the detected cover region
    #[serde(default)]
    pub use_comic_detection: bool,
    /// Treat candidate cache misses as failures instead of extracting live
    #[serde(default)]
    pub cache_only: bool,
}

/// Named bundle of matching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPreset {
    /// Detector enablement; detectors absent from the map are disabled
    pub detectors: BTreeMap<DetectorKind, bool>,
    /// Fusion weights (need not sum to 1)
    #[serde(default)]
    pub feature_weights: BTreeMap<DetectorKind, f64>,
    /// Longest side images are resized to before extraction
    pub image_size: u32,
    /// Parallelism cap for items, candidates and CPU work
    pub max_workers: usize,
    /// Minimum fused similarity for a match (inclusive)
    pub similarity_threshold: f64,
    /// Ranked matches retained per image
    #[serde(default = "default_result_batch")]
    pub result_batch: usize,
    #[serde(default)]
    pub options: PresetOptions,
}

fn default_result_batch() -> usize {
    5
}

impl ConfigPreset {
    /// Reject out-of-range values
    pub fn validate(&self) -> Result<()> {
        if self.enabled_detectors().is_empty() {
            return Err(Error::InvalidInput(
                "preset must enable at least one detector".to_string(),
            ));
        }
        for (kind, weight) in &self.feature_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "weight for {} must be a finite number >= 0, got {}",
                    kind, weight
                )));
            }
        }
        if !(MIN_IMAGE_SIZE..=MAX_IMAGE_SIZE).contains(&self.image_size) {
            return Err(Error::InvalidInput(format!(
                "image_size must be within {}..={}, got {}",
                MIN_IMAGE_SIZE, MAX_IMAGE_SIZE, self.image_size
            )));
        }
        if !(1..=MAX_WORKERS_LIMIT).contains(&self.max_workers) {
            return Err(Error::InvalidInput(format!(
                "max_workers must be within 1..={}, got {}",
                MAX_WORKERS_LIMIT, self.max_workers
            )));
        }
        validate_threshold(self.similarity_threshold)?;
        if self.result_batch == 0 {
            return Err(Error::InvalidInput(
                "result_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Enabled detectors in stable order
    pub fn enabled_detectors(&self) -> Vec<DetectorKind> {
        self.detectors
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn weight_for(&self, kind: DetectorKind) -> f64 {
        self.feature_weights
            .get(&kind)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Weights of every enabled detector, defaults filled in
    pub fn effective_weights(&self) -> BTreeMap<DetectorKind, f64> {
        self.enabled_detectors()
            .into_iter()
            .map(|kind| (kind, self.weight_for(kind)))
            .collect()
    }

    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            image_size: self.image_size,
            crop_to_cover: self.options.use_comic_detection,
        }
    }
}

pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::InvalidInput(format!(
            "similarity_threshold must be within 0..=1, got {}",
            threshold
        )));
    }
    Ok(())
}

/// Whether `name` is usable as a preset name
pub fn is_valid_preset_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// All presets plus the active selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresetCatalog {
    /// Name of the active preset (`performance_level`)
    pub performance_level: String,
    pub presets: BTreeMap<String, ConfigPreset>,
}

impl PresetCatalog {
    pub fn active(&self) -> Option<&ConfigPreset> {
        self.presets.get(&self.performance_level)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, preset) in &self.presets {
            if !is_valid_preset_name(name) {
                return Err(Error::Config(format!("invalid preset name {:?}", name)));
            }
            preset
                .validate()
                .map_err(|e| Error::Config(format!("preset {}: {}", name, e)))?;
        }
        if self.active().is_none() {
            return Err(Error::Config(format!(
                "active preset {:?} is not defined",
                self.performance_level
            )));
        }
        Ok(())
    }
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self {
            performance_level: DEFAULT_ACTIVE_PRESET.to_string(),
            presets: builtin_presets(),
        }
    }
}

fn builtin(
    image_size: u32,
    max_workers: usize,
    similarity_threshold: f64,
    weights: [(DetectorKind, f64); 2],
    options: PresetOptions,
) -> ConfigPreset {
    // Keypoint detectors are listed (disabled) so hosts that register them
    // only need to flip the flag.
    let mut detectors: BTreeMap<DetectorKind, bool> =
        DetectorKind::ALL.into_iter().map(|kind| (kind, false)).collect();
    for (kind, _) in &weights {
        detectors.insert(*kind, true);
    }

    ConfigPreset {
        detectors,
        feature_weights: weights.into_iter().collect(),
        image_size,
        max_workers,
        similarity_threshold,
        result_batch: default_result_batch(),
        options,
    }
}

/// Presets seeded on first start
pub fn builtin_presets() -> BTreeMap<String, ConfigPreset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "fast".to_string(),
        builtin(
            256,
            8,
            0.6,
            [
                (DetectorKind::GridHash, 1.0),
                (DetectorKind::ColorHistogram, 0.5),
            ],
            PresetOptions::default(),
        ),
    );
    presets.insert(
        "balanced".to_string(),
        builtin(
            512,
            4,
            0.65,
            [
                (DetectorKind::GridHash, 1.0),
                (DetectorKind::ColorHistogram, 1.0),
            ],
            PresetOptions {
                use_comic_detection: true,
                ..PresetOptions::default()
            },
        ),
    );
    presets.insert(
        "accurate".to_string(),
        builtin(
            1024,
            2,
            0.7,
            [
                (DetectorKind::GridHash, 2.0),
                (DetectorKind::ColorHistogram, 1.0),
            ],
            PresetOptions {
                use_advanced_matching: true,
                use_comic_detection: true,
                cache_only: false,
            },
        ),
    );
    presets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = PresetCatalog::default();
        catalog.validate().unwrap();
        assert_eq!(catalog.performance_level, "balanced");
        assert_eq!(
            catalog.presets.keys().collect::<Vec<_>>(),
            vec!["accurate", "balanced", "fast"]
        );
        assert_eq!(
            catalog.active().unwrap().enabled_detectors(),
            vec![DetectorKind::GridHash, DetectorKind::ColorHistogram]
        );
    }

    #[test]
    fn test_unknown_detector_rejected_at_load() {
        let json = r#"{
            "detectors": {"grid_hash": true, "surf": true},
            "image_size": 512,
            "max_workers": 2,
            "similarity_threshold": 0.5
        }"#;
        assert!(serde_json::from_str::<ConfigPreset>(json).is_err());
    }

    #[test]
    fn test_unknown_field_rejected_at_load() {
        let json = r#"{
            "detectors": {"grid_hash": true},
            "image_size": 512,
            "max_workers": 2,
            "similarity_threshold": 0.5,
            "turbo": true
        }"#;
        assert!(serde_json::from_str::<ConfigPreset>(json).is_err());
    }

    #[test]
    fn test_defaults_and_weight_fallback() {
        let json = r#"{
            "detectors": {"grid_hash": true, "color_histogram": true, "orb": false},
            "feature_weights": {"grid_hash": 3.0},
            "image_size": 300,
            "max_workers": 2,
            "similarity_threshold": 0.5
        }"#;
        let preset: ConfigPreset = serde_json::from_str(json).unwrap();
        preset.validate().unwrap();
        assert_eq!(preset.result_batch, 5);
        assert_eq!(preset.options, PresetOptions::default());
        assert_eq!(preset.weight_for(DetectorKind::GridHash), 3.0);
        assert_eq!(preset.weight_for(DetectorKind::ColorHistogram), 1.0);
        assert_eq!(preset.effective_weights().len(), 2);
    }

    #[test]
    fn test_validate_ranges() {
        let base = builtin_presets().remove("fast").unwrap();

        let mut preset = base.clone();
        preset.image_size = 32;
        assert!(preset.validate().is_err());

        let mut preset = base.clone();
        preset.max_workers = 0;
        assert!(preset.validate().is_err());

        let mut preset = base.clone();
        preset.similarity_threshold = 1.5;
        assert!(preset.validate().is_err());

        let mut preset = base.clone();
        preset
            .feature_weights
            .insert(DetectorKind::GridHash, f64::NAN);
        assert!(preset.validate().is_err());

        let mut preset = base.clone();
        preset.detectors.values_mut().for_each(|v| *v = false);
        assert!(preset.validate().is_err());

        let mut preset = base;
        preset.result_batch = 0;
        assert!(preset.validate().is_err());
    }

    #[test]
    fn test_preset_names() {
        assert!(is_valid_preset_name("night-scan_2"));
        assert!(!is_valid_preset_name(""));
        assert!(!is_valid_preset_name("Fast"));
        assert!(!is_valid_preset_name("a/b"));
    }

    #[test]
    fn test_catalog_with_missing_active_is_invalid() {
        let catalog = PresetCatalog {
            performance_level: "extreme".to_string(),
            presets: builtin_presets(),
        };
        assert!(matches!(catalog.validate(), Err(Error::Config(_))));
    }
}
