//! Image decoding and normalization ahead of feature extraction

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, RgbImage};
use thiserror::Error;

/// Luminance difference from the background that counts as content
const MARGIN_TOLERANCE: i16 = 24;
/// Fraction of a row/column that must differ from background to count as content
const MARGIN_CONTENT_FRACTION: f64 = 0.05;
/// Crops smaller than this fraction of the source are rejected as misdetections
const MIN_CROP_AREA_FRACTION: f64 = 0.25;
/// Longest side of the working copy used to locate the cover region
const DETECTION_WORKING_SIZE: u32 = 256;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ImageError {
    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Image has no pixels")]
    Empty,
}

/// Preparation parameters derived from the active preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Longest side after resizing
    pub image_size: u32,
    /// Trim near-uniform margins around the cover before resizing
    pub crop_to_cover: bool,
}

impl PrepareOptions {
    /// Compact tag identifying how descriptors were prepared, used in cache keys
    pub fn tag(&self) -> String {
        if self.crop_to_cover {
            format!("{}c", self.image_size)
        } else {
            self.image_size.to_string()
        }
    }
}

/// Normalized image handed to detectors
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub rgb: RgbImage,
    pub gray: GrayImage,
}

impl PreparedImage {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Decode raw bytes in any supported format
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    let image = image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::Empty);
    }
    Ok(image)
}

/// Crop (optionally) and resize a decoded image to the canonical size
pub fn prepare(image: &DynamicImage, options: PrepareOptions) -> PreparedImage {
    let source = if options.crop_to_cover {
        match cover_bounds(image) {
            Some((x, y, w, h)) => {
                tracing::debug!(x, y, w, h, "Cropped to detected cover region");
                image.crop_imm(x, y, w, h)
            }
            None => image.clone(),
        }
    } else {
        image.clone()
    };

    let size = options.image_size.max(1);
    let resized = source.resize(size, size, FilterType::Triangle);

    PreparedImage {
        rgb: resized.to_rgb8(),
        gray: resized.to_luma8(),
    }
}

/// Locate the cover inside a photo by trimming margins that match the border color
///
/// Returns `(x, y, width, height)` in source coordinates, or `None` when no
/// meaningful margin was found.
fn cover_bounds(image: &DynamicImage) -> Option<(u32, u32, u32, u32)> {
    let (src_w, src_h) = image.dimensions();
    let working = image
        .resize(DETECTION_WORKING_SIZE, DETECTION_WORKING_SIZE, FilterType::Triangle)
        .to_luma8();
    let (left, top, width, height) = content_bounds(&working)?;

    let scale_x = f64::from(src_w) / f64::from(working.width());
    let scale_y = f64::from(src_h) / f64::from(working.height());

    let x = (f64::from(left) * scale_x).floor() as u32;
    let y = (f64::from(top) * scale_y).floor() as u32;
    let w = ((f64::from(width) * scale_x).ceil() as u32).min(src_w - x);
    let h = ((f64::from(height) * scale_y).ceil() as u32).min(src_h - y);

    Some((x, y, w.max(1), h.max(1)))
}

fn content_bounds(gray: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = gray.dimensions();
    if w < 8 || h < 8 {
        return None;
    }

    let background = border_mean(gray);
    let differs = |x: u32, y: u32| {
        (i16::from(gray.get_pixel(x, y)[0]) - background).abs() > MARGIN_TOLERANCE
    };

    let row_is_content = |y: u32| {
        let count = (0..w).filter(|&x| differs(x, y)).count();
        count as f64 > f64::from(w) * MARGIN_CONTENT_FRACTION
    };
    let col_is_content = |x: u32| {
        let count = (0..h).filter(|&y| differs(x, y)).count();
        count as f64 > f64::from(h) * MARGIN_CONTENT_FRACTION
    };

    let top = (0..h).find(|&y| row_is_content(y))?;
    let bottom = (0..h).rev().find(|&y| row_is_content(y))?;
    let left = (0..w).find(|&x| col_is_content(x))?;
    let right = (0..w).rev().find(|&x| col_is_content(x))?;

    let crop_w = right.checked_sub(left)? + 1;
    let crop_h = bottom.checked_sub(top)? + 1;

    if crop_w == w && crop_h == h {
        return None;
    }
    let area_fraction = f64::from(crop_w * crop_h) / f64::from(w * h);
    if area_fraction < MIN_CROP_AREA_FRACTION {
        return None;
    }

    Some((left, top, crop_w, crop_h))
}

fn border_mean(gray: &GrayImage) -> i16 {
    let (w, h) = gray.dimensions();
    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for x in 0..w {
        sum += u64::from(gray.get_pixel(x, 0)[0]) + u64::from(gray.get_pixel(x, h - 1)[0]);
        count += 2;
    }
    for y in 1..h - 1 {
        sum += u64::from(gray.get_pixel(0, y)[0]) + u64::from(gray.get_pixel(w - 1, y)[0]);
        count += 2;
    }
    (sum / count.max(1)) as i16
}
