//! Baseline comparison
//!
//! Comparison is pluggable through [`ImageComparator`]. The bundled
//! [`PixelComparator`] counts decoded pixels that differ from the baseline,
//! accepts the image while that count stays within its threshold, and
//! otherwise marks the unequal pixels in a diff mask.

use image::{Pixel, Rgba, RgbaImage};
use tracing::debug;

use crate::capture::encode_png;
use crate::error::RunnerResult;

/// Outcome of comparing one image against its baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub matches: bool,
    /// PNG highlighting the differences, when the comparator produces one
    pub diff: Option<Vec<u8>>,
}

impl Comparison {
    pub fn matched() -> Self {
        Self {
            matches: true,
            diff: None,
        }
    }
}

pub trait ImageComparator: Send + Sync {
    fn compare(&self, actual: &[u8], expect: &[u8]) -> RunnerResult<Comparison>;
}

/// Per-pixel comparison with a tolerated share of differing pixels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PixelComparator {
    threshold: f64,
}

impl PixelComparator {
    /// Allow up to `threshold` (0.0 to 1.0) of the pixels to differ
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Every pixel must match
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl ImageComparator for PixelComparator {
    fn compare(&self, actual: &[u8], expect: &[u8]) -> RunnerResult<Comparison> {
        if actual == expect {
            return Ok(Comparison::matched());
        }

        let actual = image::load_from_memory(actual)?.to_rgba8();
        let expect = image::load_from_memory(expect)?.to_rgba8();

        if actual.dimensions() != expect.dimensions() {
            debug!(
                "Image size changed: {:?} vs baseline {:?}",
                actual.dimensions(),
                expect.dimensions()
            );
            return Ok(Comparison {
                matches: false,
                diff: None,
            });
        }

        let mut differing = 0u64;
        let mask = RgbaImage::from_fn(actual.width(), actual.height(), |x, y| {
            let a = actual.get_pixel(x, y);
            if a == expect.get_pixel(x, y) {
                let c = a.channels();
                Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128])
            } else {
                differing += 1;
                Rgba([255, 0, 0, 255])
            }
        });

        let total = u64::from(actual.width()) * u64::from(actual.height());
        if differing as f64 <= self.threshold * total as f64 {
            if differing > 0 {
                debug!("{} of {} pixels differ, within threshold", differing, total);
            }
            return Ok(Comparison::matched());
        }
        Ok(Comparison {
            matches: false,
            diff: Some(encode_png(mask)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(image: RgbaImage) -> Vec<u8> {
        encode_png(image).unwrap()
    }

    #[test]
    fn test_identical_pixels_match() {
        let image = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 255]));
        let comparison = PixelComparator::exact().compare(&png(image.clone()), &png(image)).unwrap();
        assert!(comparison.matches);
        assert!(comparison.diff.is_none());
    }

    #[test]
    fn test_single_pixel_change_produces_mask() {
        let expect = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 255]));
        let mut actual = expect.clone();
        actual.put_pixel(1, 1, Rgba([9, 9, 9, 255]));

        let comparison = PixelComparator::exact().compare(&png(actual), &png(expect)).unwrap();
        assert!(!comparison.matches);
        let mask = image::load_from_memory(&comparison.diff.unwrap()).unwrap().to_rgba8();
        assert_eq!(*mask.get_pixel(1, 1), Rgba([255, 0, 0, 255]));
        assert_eq!(mask.get_pixel(0, 0)[3], 128);
    }

    #[test]
    fn test_size_change_is_a_mismatch() {
        let comparison = PixelComparator::exact()
            .compare(&png(RgbaImage::new(2, 2)), &png(RgbaImage::new(3, 2)))
            .unwrap();
        assert!(!comparison.matches);
    }

    #[test]
    fn test_threshold_tolerates_a_share_of_pixels() {
        let expect = RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 255]));
        let mut actual = expect.clone();
        for x in 0..5 {
            actual.put_pixel(x, 0, Rgba([9, 9, 9, 255]));
        }
        let (actual, expect) = (png(actual), png(expect));

        assert!(PixelComparator::new(0.05).compare(&actual, &expect).unwrap().matches);
        let strict = PixelComparator::new(0.04).compare(&actual, &expect).unwrap();
        assert!(!strict.matches);
        assert!(strict.diff.is_some());
        assert!(!PixelComparator::exact().compare(&actual, &expect).unwrap().matches);
    }

    #[test]
    fn test_threshold_never_excuses_a_size_change() {
        let comparison = PixelComparator::new(1.0)
            .compare(&png(RgbaImage::new(2, 2)), &png(RgbaImage::new(3, 2)))
            .unwrap();
        assert!(!comparison.matches);
        assert_eq!(PixelComparator::new(7.0).threshold(), 1.0);
    }
}
