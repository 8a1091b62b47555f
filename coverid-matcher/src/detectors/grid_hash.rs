//! Grid gradient-hash detector
//!
//! Splits the grayscale image into a `grid x grid` mesh of tiles and encodes
//! each tile as a 64-bit difference hash (9x8 downsample, one bit per
//! horizontal neighbour comparison). Tiles are compared by Hamming distance;
//! a tile within `max_distance` bits counts as a good match.
//!
//! In advanced mode a query tile may also match any of its 8 neighbouring
//! candidate tiles, which tolerates photos that are slightly shifted or
//! cropped relative to the reference cover.

use super::{
    ensure_kind, DescriptorData, DescriptorSet, Detector, DetectorError, DetectorKind,
    DetectorStats, PreparedImage,
};
use image::imageops::{self, FilterType};

const DEFAULT_GRID: u32 = 8;
const DEFAULT_MAX_DISTANCE: u32 = 10;

#[derive(Debug, Clone)]
pub struct GridHashDetector {
    grid: u32,
    max_distance: u32,
}

impl Default for GridHashDetector {
    fn default() -> Self {
        Self::new(DEFAULT_GRID, DEFAULT_MAX_DISTANCE)
    }
}

impl GridHashDetector {
    pub fn new(grid: u32, max_distance: u32) -> Self {
        Self {
            grid: grid.max(1),
            max_distance,
        }
    }

    fn tile_hash(&self, image: &PreparedImage, tx: u32, ty: u32) -> u64 {
        let (w, h) = image.gray.dimensions();
        let x0 = tx * w / self.grid;
        let x1 = (tx + 1) * w / self.grid;
        let y0 = ty * h / self.grid;
        let y1 = (ty + 1) * h / self.grid;

        let tile = imageops::crop_imm(&image.gray, x0, y0, x1 - x0, y1 - y0).to_image();
        let small = imageops::resize(&tile, 9, 8, FilterType::Triangle);

        let mut hash = 0u64;
        for y in 0..8 {
            for x in 0..8 {
                hash <<= 1;
                if small.get_pixel(x, y)[0] < small.get_pixel(x + 1, y)[0] {
                    hash |= 1;
                }
            }
        }
        hash
    }

    fn best_distance(&self, query: u64, candidate: &[u64], index: usize, advanced: bool) -> u32 {
        if !advanced {
            return (query ^ candidate[index]).count_ones();
        }

        let grid = self.grid as i64;
        let row = index as i64 / grid;
        let col = index as i64 % grid;
        let mut best = u32::MAX;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (r, c) = (row + dy, col + dx);
                if r < 0 || c < 0 || r >= grid || c >= grid {
                    continue;
                }
                let distance = (query ^ candidate[(r * grid + c) as usize]).count_ones();
                best = best.min(distance);
            }
        }
        best
    }
}

impl Detector for GridHashDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::GridHash
    }

    fn extract(&self, image: &PreparedImage) -> Result<DescriptorSet, DetectorError> {
        let (w, h) = image.gray.dimensions();
        if w < self.grid || h < self.grid {
            return Err(DetectorError::Extraction(format!(
                "image {}x{} smaller than {}x{} grid",
                w, h, self.grid, self.grid
            )));
        }

        let mut hashes = Vec::with_capacity((self.grid * self.grid) as usize);
        for ty in 0..self.grid {
            for tx in 0..self.grid {
                hashes.push(self.tile_hash(image, tx, ty));
            }
        }

        Ok(DescriptorSet {
            detector: DetectorKind::GridHash,
            keypoints: hashes.len() as u32,
            data: DescriptorData::Binary(hashes),
        })
    }

    fn compare(
        &self,
        query: &DescriptorSet,
        candidate: &DescriptorSet,
        advanced: bool,
    ) -> Result<DetectorStats, DetectorError> {
        ensure_kind(DetectorKind::GridHash, query, candidate)?;

        let (q, c) = match (&query.data, &candidate.data) {
            (DescriptorData::Binary(q), DescriptorData::Binary(c)) => (q, c),
            _ => {
                return Err(DetectorError::Comparison(
                    "grid hash descriptors must be binary".to_string(),
                ))
            }
        };
        let expected = (self.grid * self.grid) as usize;
        if q.len() != expected || c.len() != expected {
            return Err(DetectorError::Comparison(format!(
                "expected {} tiles, got {} and {}",
                expected,
                q.len(),
                c.len()
            )));
        }

        let good = q
            .iter()
            .enumerate()
            .filter(|(i, hash)| self.best_distance(**hash, c, *i, advanced) <= self.max_distance)
            .count();

        Ok(DetectorStats::from_counts(good as u32, expected as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn prepared_from_fn(size: u32, f: impl Fn(u32, u32) -> u8) -> PreparedImage {
        let gray = GrayImage::from_fn(size, size, |x, y| Luma([f(x, y)]));
        let rgb = RgbImage::from_fn(size, size, |x, y| {
            let v = gray.get_pixel(x, y)[0];
            image::Rgb([v, v, v])
        });
        PreparedImage { rgb, gray }
    }

    #[test]
    fn test_identical_images_match_fully() {
        let detector = GridHashDetector::default();
        let image = prepared_from_fn(128, |x, y| ((x * 7 + y * 3) % 256) as u8);

        let a = detector.extract(&image).unwrap();
        let b = detector.extract(&image).unwrap();
        assert_eq!(a.keypoints, 64);

        let stats = detector.compare(&a, &b, false).unwrap();
        assert_eq!(stats.good_matches, 64);
        assert_eq!(stats.total_matches, 64);
        assert_eq!(stats.similarity, 1.0);
    }

    #[test]
    fn test_opposite_gradients_do_not_match() {
        let detector = GridHashDetector::default();
        let rising = prepared_from_fn(128, |x, _| (x * 2) as u8);
        let falling = prepared_from_fn(128, |x, _| (255 - x * 2) as u8);

        let stats = detector
            .compare(
                &detector.extract(&rising).unwrap(),
                &detector.extract(&falling).unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(stats.good_matches, 0);
        assert_eq!(stats.similarity, 0.0);
    }

    #[test]
    fn test_advanced_mode_never_scores_lower() {
        let detector = GridHashDetector::default();
        let a = prepared_from_fn(128, |x, y| ((x / 16 + y / 16) % 2 * 200) as u8);
        let b = prepared_from_fn(128, |x, y| (((x + 16) / 16 + y / 16) % 2 * 200) as u8);
        let da = detector.extract(&a).unwrap();
        let db = detector.extract(&b).unwrap();

        let strict = detector.compare(&da, &db, false).unwrap();
        let tolerant = detector.compare(&da, &db, true).unwrap();
        assert!(tolerant.good_matches >= strict.good_matches);
    }

    #[test]
    fn test_too_small_image_is_extraction_error() {
        let detector = GridHashDetector::default();
        let tiny = prepared_from_fn(4, |_, _| 0);
        assert!(matches!(
            detector.extract(&tiny),
            Err(DetectorError::Extraction(_))
        ));
    }

    #[test]
    fn test_foreign_descriptors_rejected() {
        let detector = GridHashDetector::default();
        let image = prepared_from_fn(64, |x, _| x as u8);
        let ours = detector.extract(&image).unwrap();
        let foreign = DescriptorSet {
            detector: DetectorKind::Orb,
            keypoints: 0,
            data: DescriptorData::Raw {
                descriptor_len: 32,
                bytes: Vec::new(),
            },
        };
        assert_eq!(
            detector.compare(&ours, &foreign, false),
            Err(DetectorError::Incompatible {
                expected: DetectorKind::GridHash,
                found: DetectorKind::Orb,
            })
        );
    }
}
