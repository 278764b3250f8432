//! Pixel preprocessing applied before inference.
//!
//! Clients send either 8-bit values (0-255) or values already scaled to [0, 1],
//! and either white strokes on black (what the model was trained on) or black
//! ink on a white canvas. [`StandardNormalizer`] rescales the former and, by
//! default, inverts majority-bright images to cover the latter.

use crate::domain::MAX_PIXEL_VALUE;

/// Normalized model input plus which transforms were applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPixels {
    pub values: Vec<f32>,
    pub scaled: bool,
    pub inverted: bool,
}

/// Turns submitted pixel values into model input.
pub trait PixelNormalizer: Send + Sync {
    fn normalize(&self, pixels: &[f64]) -> NormalizedPixels;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// When to flip dark-on-light drawings to light-on-dark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InversionPolicy {
    /// Invert when the mean intensity after scaling exceeds the threshold.
    MeanAbove(f64),
    Disabled,
}

impl Default for InversionPolicy {
    fn default() -> Self {
        InversionPolicy::MeanAbove(0.5)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StandardNormalizer {
    inversion: InversionPolicy,
}

impl StandardNormalizer {
    /// Values above this are taken to be 8-bit intensities.
    pub const SCALE_THRESHOLD: f64 = 1.0;

    pub fn new(inversion: InversionPolicy) -> Self {
        Self { inversion }
    }

    pub fn inversion(&self) -> InversionPolicy {
        self.inversion
    }
}

impl PixelNormalizer for StandardNormalizer {
    fn normalize(&self, pixels: &[f64]) -> NormalizedPixels {
        let max = pixels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let scaled = max > Self::SCALE_THRESHOLD;

        let mut values: Vec<f64> = if scaled {
            pixels.iter().map(|v| v / MAX_PIXEL_VALUE).collect()
        } else {
            pixels.to_vec()
        };

        let inverted = match self.inversion {
            InversionPolicy::MeanAbove(threshold) if !values.is_empty() => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                mean > threshold
            }
            _ => false,
        };

        if inverted {
            for v in values.iter_mut() {
                *v = 1.0 - *v;
            }
        }

        NormalizedPixels {
            values: values.into_iter().map(|v| v as f32).collect(),
            scaled,
            inverted,
        }
    }

    fn name(&self) -> &'static str {
        match self.inversion {
            InversionPolicy::MeanAbove(_) => "scale+invert",
            InversionPolicy::Disabled => "scale",
        }
    }
}
