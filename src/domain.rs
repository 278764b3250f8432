//! Drawing records and prediction results shared by the pipeline, the stores
//! and the HTTP layer.

use crate::error::{DigitError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Side length of the square input grid.
pub const IMAGE_SIDE: usize = 28;
/// Number of values in a flattened 28x28 grid.
pub const PIXEL_COUNT: usize = IMAGE_SIDE * IMAGE_SIDE;
/// Number of digit classes (0-9).
pub const CLASS_COUNT: usize = 10;
/// Largest accepted raw pixel value (8-bit grayscale).
pub const MAX_PIXEL_VALUE: f64 = 255.0;

/// Output of a single inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_digit: u8,
    pub confidence: f64,
    pub probabilities: Vec<f64>,
}

impl Prediction {
    /// Build a prediction from a class distribution: digit is the argmax and
    /// confidence its value. Ties resolve to the lowest digit.
    pub fn from_probabilities(probabilities: Vec<f64>) -> Result<Self> {
        if probabilities.len() != CLASS_COUNT {
            return Err(DigitError::Inference {
                message: format!(
                    "expected {} class probabilities, got {}",
                    CLASS_COUNT,
                    probabilities.len()
                ),
            });
        }

        let (digit, confidence) = argmax(&probabilities);

        Ok(Self {
            predicted_digit: digit as u8,
            confidence,
            probabilities,
        })
    }
}

fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

/// A stored drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: i64,
    pub pixels: Vec<f64>,
    pub predicted_digit: u8,
    pub confidence: Option<f64>,
    pub probabilities: Option<Vec<f64>>,
    pub created_at: DateTime<Utc>,
}

/// A drawing that has passed validation but has not been assigned an id yet.
///
/// The only way to build one is [`NewDrawing::new`] (or the conversion from a
/// [`Prediction`]), so every store receives records that already satisfy the
/// pixel count, digit range and probability/argmax invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDrawing {
    pixels: Vec<f64>,
    predicted_digit: u8,
    confidence: Option<f64>,
    probabilities: Option<Vec<f64>>,
}

impl NewDrawing {
    pub fn new(
        pixels: Vec<f64>,
        predicted_digit: u8,
        confidence: Option<f64>,
        probabilities: Option<Vec<f64>>,
    ) -> Result<Self> {
        validate_pixels(&pixels)?;

        if usize::from(predicted_digit) >= CLASS_COUNT {
            return Err(DigitError::Validation(format!(
                "predicted_digit must be between 0 and 9, got {predicted_digit}"
            )));
        }

        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(DigitError::Validation(format!(
                    "confidence must be between 0 and 1, got {c}"
                )));
            }
        }

        if let Some(probs) = &probabilities {
            if probs.len() != CLASS_COUNT {
                return Err(DigitError::Validation(format!(
                    "probabilities must contain exactly {} values, got {}",
                    CLASS_COUNT,
                    probs.len()
                )));
            }
            let (digit, max) = argmax(probs);
            if digit != usize::from(predicted_digit) {
                return Err(DigitError::Validation(format!(
                    "predicted_digit {predicted_digit} is not the most probable class ({digit})"
                )));
            }
            if confidence != Some(max) {
                return Err(DigitError::Validation(
                    "confidence must equal the highest class probability".to_string(),
                ));
            }
        }

        Ok(Self {
            pixels,
            predicted_digit,
            confidence,
            probabilities,
        })
    }

    /// Record for a drawing classified by the model. `pixels` are the values as
    /// submitted, before normalization.
    pub fn from_prediction(pixels: Vec<f64>, prediction: &Prediction) -> Result<Self> {
        Self::new(
            pixels,
            prediction.predicted_digit,
            Some(prediction.confidence),
            Some(prediction.probabilities.clone()),
        )
    }

    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    pub fn predicted_digit(&self) -> u8 {
        self.predicted_digit
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn probabilities(&self) -> Option<&[f64]> {
        self.probabilities.as_deref()
    }

    /// Attach the store-assigned id and creation time.
    pub fn into_drawing(self, id: i64, created_at: DateTime<Utc>) -> Drawing {
        Drawing {
            id,
            pixels: self.pixels,
            predicted_digit: self.predicted_digit,
            confidence: self.confidence,
            probabilities: self.probabilities,
            created_at,
        }
    }
}

/// Check shape and range of a submitted pixel vector.
pub fn validate_pixels(pixels: &[f64]) -> Result<()> {
    if pixels.len() != PIXEL_COUNT {
        return Err(DigitError::Validation(format!(
            "pixels must contain exactly {} values, got {}",
            PIXEL_COUNT,
            pixels.len()
        )));
    }

    if let Some((i, v)) = pixels
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || **v < 0.0 || **v > MAX_PIXEL_VALUE)
    {
        return Err(DigitError::Validation(format!(
            "pixel {i} has value {v}, expected a number between 0 and {MAX_PIXEL_VALUE}"
        )));
    }

    Ok(())
}

/// Pagination window for listing drawings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Creation timestamp truncated to the precision the stores persist.
pub fn creation_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
