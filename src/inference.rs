//! Model loading and invocation.
//!
//! [`InferenceAdapter`] owns the process-wide model. It is built once at
//! startup, loaded exactly once, and shared read-only between request tasks.

use crate::domain::{Prediction, CLASS_COUNT, PIXEL_COUNT};
use crate::error::{DigitError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Tolerance used to decide whether a model output is already a distribution.
const DISTRIBUTION_TOLERANCE: f64 = 1e-3;

/// A trained digit classifier: 784 normalized pixels in, 10 scores out.
pub trait DigitModel: Send + Sync {
    fn infer(&self, input: &[f32]) -> Result<Vec<f32>>;
}

type OnnxPlan = tract_onnx::prelude::TypedRunnableModel<tract_onnx::prelude::TypedModel>;

/// ONNX export of the classifier, executed with tract.
pub struct OnnxDigitModel {
    plan: OnnxPlan,
}

impl OnnxDigitModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        use tract_onnx::prelude::*;

        let path = path.as_ref();
        let load_err = |e: TractError| DigitError::ModelLoad {
            message: format!("{}: {e}", path.display()),
        };

        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(load_err)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, PIXEL_COUNT)),
            )
            .map_err(load_err)?
            .into_optimized()
            .map_err(load_err)?
            .into_runnable()
            .map_err(load_err)?;

        Ok(Self { plan })
    }
}

impl DigitModel for OnnxDigitModel {
    fn infer(&self, input: &[f32]) -> Result<Vec<f32>> {
        use tract_onnx::prelude::*;

        let infer_err = |e: TractError| DigitError::Inference {
            message: e.to_string(),
        };

        let tensor: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, PIXEL_COUNT), input.to_vec())
                .map_err(|e| DigitError::Inference {
                    message: format!("bad input shape: {e}"),
                })?
                .into();

        let outputs = self.plan.run(tvec!(tensor.into())).map_err(infer_err)?;
        let output = outputs.first().ok_or_else(|| DigitError::Inference {
            message: "model returned no outputs".to_string(),
        })?;
        let view = output.to_array_view::<f32>().map_err(infer_err)?;

        Ok(view.iter().copied().collect())
    }
}

/// Process-wide handle to the classifier.
#[derive(Default)]
pub struct InferenceAdapter {
    model: OnceCell<Arc<dyn DigitModel>>,
}

impl InferenceAdapter {
    /// An adapter with no model; [`classify`](Self::classify) fails with
    /// `ModelUnavailable` until one is installed.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn DigitModel>) -> Self {
        let adapter = Self::new();
        // A fresh cell always accepts the first value.
        let _ = adapter.model.set(model);
        adapter
    }

    /// Load the ONNX artifact at `path`. Allowed once per adapter.
    pub fn load_onnx(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let model = OnnxDigitModel::load(path)?;
        self.install(Arc::new(model))?;
        info!("Model loaded from {}", path.display());
        Ok(())
    }

    pub fn install(&self, model: Arc<dyn DigitModel>) -> Result<()> {
        self.model.set(model).map_err(|_| DigitError::ModelLoad {
            message: "a model is already loaded".to_string(),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    /// Run the model on normalized pixels and shape the output into a prediction.
    pub fn classify(&self, input: &[f32]) -> Result<Prediction> {
        let model = self.model.get().ok_or(DigitError::ModelUnavailable)?;

        if input.len() != PIXEL_COUNT {
            return Err(DigitError::Validation(format!(
                "model input must contain exactly {} values, got {}",
                PIXEL_COUNT,
                input.len()
            )));
        }

        let raw = model.infer(input)?;
        Prediction::from_probabilities(to_distribution(raw)?)
    }
}

/// Validate model output and turn it into a probability distribution.
/// Outputs that are already close to one (softmax heads) are rescaled so they
/// sum to exactly one; anything else (e.g. logits from an export without the
/// final activation) goes through softmax.
fn to_distribution(raw: Vec<f32>) -> Result<Vec<f64>> {
    if raw.len() != CLASS_COUNT {
        return Err(DigitError::Inference {
            message: format!("model returned {} scores, expected {}", raw.len(), CLASS_COUNT),
        });
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(DigitError::Inference {
            message: "model returned non-finite scores".to_string(),
        });
    }

    let scores: Vec<f64> = raw.into_iter().map(f64::from).collect();
    let sum: f64 = scores.iter().sum();
    let is_distribution =
        scores.iter().all(|&v| v >= 0.0) && (sum - 1.0).abs() <= DISTRIBUTION_TOLERANCE;

    if is_distribution {
        Ok(scores.into_iter().map(|v| v / sum).collect())
    } else {
        Ok(softmax(&scores))
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|v| v / total).collect()
}
