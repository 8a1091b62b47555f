//! Per-quadrant color histogram detector
//!
//! Each quadrant of the RGB image is summarized by a normalized 64-bin
//! histogram (4 levels per channel). Quadrants are compared by histogram
//! intersection; a quadrant whose intersection reaches `match_threshold`
//! counts as a good match, and the overall similarity is the mean
//! intersection across quadrants.

use super::{
    ensure_kind, DescriptorData, DescriptorSet, Detector, DetectorError, DetectorKind,
    DetectorStats, PreparedImage,
};

const LEVELS: u32 = 4;
const BINS: usize = (LEVELS * LEVELS * LEVELS) as usize;
const REGIONS_PER_SIDE: u32 = 2;
const DEFAULT_MATCH_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct ColorHistogramDetector {
    match_threshold: f32,
}

impl Default for ColorHistogramDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl ColorHistogramDetector {
    pub fn new(match_threshold: f32) -> Self {
        Self {
            match_threshold: match_threshold.clamp(0.0, 1.0),
        }
    }

    fn bin_index(pixel: &image::Rgb<u8>) -> usize {
        let q = |v: u8| u32::from(v) * LEVELS / 256;
        let [r, g, b] = pixel.0;
        (q(r) * LEVELS * LEVELS + q(g) * LEVELS + q(b)) as usize
    }

    /// Histogram intersection in f64, relative to the heavier histogram
    ///
    /// Dividing by the stored mass cancels the rounding of the f32 bins, so
    /// identical regions intersect at exactly 1.0.
    fn intersection(a: &[f32], b: &[f32]) -> f64 {
        let mass_a: f64 = a.iter().map(|&v| f64::from(v)).sum();
        let mass_b: f64 = b.iter().map(|&v| f64::from(v)).sum();
        let mass = mass_a.max(mass_b);
        if mass <= 0.0 {
            return 0.0;
        }
        let shared: f64 = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| f64::from(x.min(y)))
            .sum();
        (shared / mass).min(1.0)
    }

    fn region_histogram(image: &PreparedImage, rx: u32, ry: u32) -> [f32; BINS] {
        let (w, h) = image.rgb.dimensions();
        let x0 = rx * w / REGIONS_PER_SIDE;
        let x1 = (rx + 1) * w / REGIONS_PER_SIDE;
        let y0 = ry * h / REGIONS_PER_SIDE;
        let y1 = (ry + 1) * h / REGIONS_PER_SIDE;

        let mut counts = [0u32; BINS];
        for y in y0..y1 {
            for x in x0..x1 {
                counts[Self::bin_index(image.rgb.get_pixel(x, y))] += 1;
            }
        }

        let total = ((x1 - x0) * (y1 - y0)).max(1) as f32;
        let mut histogram = [0f32; BINS];
        for (slot, count) in histogram.iter_mut().zip(counts) {
            *slot = count as f32 / total;
        }
        histogram
    }
}

impl Detector for ColorHistogramDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::ColorHistogram
    }

    fn extract(&self, image: &PreparedImage) -> Result<DescriptorSet, DetectorError> {
        let (w, h) = image.rgb.dimensions();
        if w < REGIONS_PER_SIDE || h < REGIONS_PER_SIDE {
            return Err(DetectorError::Extraction(format!(
                "image {}x{} too small for quadrant histograms",
                w, h
            )));
        }

        let regions = REGIONS_PER_SIDE * REGIONS_PER_SIDE;
        let mut values = Vec::with_capacity(regions as usize * BINS);
        for ry in 0..REGIONS_PER_SIDE {
            for rx in 0..REGIONS_PER_SIDE {
                values.extend_from_slice(&Self::region_histogram(image, rx, ry));
            }
        }

        Ok(DescriptorSet {
            detector: DetectorKind::ColorHistogram,
            keypoints: regions,
            data: DescriptorData::Histogram { bins: BINS, values },
        })
    }

    fn compare(
        &self,
        query: &DescriptorSet,
        candidate: &DescriptorSet,
        _advanced: bool,
    ) -> Result<DetectorStats, DetectorError> {
        ensure_kind(DetectorKind::ColorHistogram, query, candidate)?;

        let (q, c) = match (&query.data, &candidate.data) {
            (
                DescriptorData::Histogram { bins: qb, values: q },
                DescriptorData::Histogram { bins: cb, values: c },
            ) if *qb == BINS && *cb == BINS => (q, c),
            _ => {
                return Err(DetectorError::Comparison(format!(
                    "color histogram descriptors must carry {} bins per region",
                    BINS
                )))
            }
        };
        if q.len() != c.len() || q.is_empty() || q.len() % BINS != 0 {
            return Err(DetectorError::Comparison(format!(
                "histogram length mismatch: {} vs {}",
                q.len(),
                c.len()
            )));
        }

        let intersections: Vec<f64> = q
            .chunks(BINS)
            .zip(c.chunks(BINS))
            .map(|(a, b)| Self::intersection(a, b))
            .collect();

        let regions = intersections.len() as u32;
        let threshold = f64::from(self.match_threshold);
        let good = intersections.iter().filter(|&&i| i >= threshold).count() as u32;
        let mean = intersections.iter().sum::<f64>() / f64::from(regions);

        Ok(DetectorStats {
            good_matches: good,
            total_matches: regions,
            similarity: mean.clamp(0.0, 1.0),
        })
    }
}
