//! Validation, normalization, inference and persistence for a single
//! submitted drawing.

use crate::domain::{validate_pixels, Drawing, NewDrawing, Prediction};
use crate::error::{DigitError, Result};
use crate::inference::InferenceAdapter;
use crate::metrics::{self, MetricName, TimingGuard};
use crate::normalize::PixelNormalizer;
use crate::storage::DrawingStore;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct PredictionPipeline {
    adapter: Arc<InferenceAdapter>,
    normalizer: Arc<dyn PixelNormalizer>,
    store: Arc<dyn DrawingStore>,
}

impl PredictionPipeline {
    pub fn new(
        adapter: Arc<InferenceAdapter>,
        normalizer: Arc<dyn PixelNormalizer>,
        store: Arc<dyn DrawingStore>,
    ) -> Self {
        Self {
            adapter,
            normalizer,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DrawingStore> {
        &self.store
    }

    pub fn model_loaded(&self) -> bool {
        self.adapter.is_loaded()
    }

    /// Classify without storing anything.
    pub async fn classify(&self, pixels: &[f64]) -> Result<Prediction> {
        validate_pixels(pixels)?;

        let normalized = self.normalizer.normalize(pixels);
        debug!(
            normalizer = self.normalizer.name(),
            scaled = normalized.scaled,
            inverted = normalized.inverted,
            "Normalized pixels"
        );

        // Inference is CPU-bound; keep it off the async workers.
        let adapter = Arc::clone(&self.adapter);
        let input = normalized.values;
        let _timer = TimingGuard::new(MetricName::InferenceDuration);
        tokio::task::spawn_blocking(move || adapter.classify(&input))
            .await
            .map_err(|e| DigitError::Inference {
                message: format!("inference task failed: {e}"),
            })?
    }

    /// Classify `pixels` and store the drawing, as submitted, with the result.
    ///
    /// If storing fails the prediction is returned inside
    /// [`DigitError::PredictionNotSaved`].
    pub async fn predict(&self, pixels: Vec<f64>) -> Result<Prediction> {
        let prediction = match self.classify(&pixels).await {
            Ok(prediction) => prediction,
            Err(e) => {
                metrics::record_prediction_error(error_kind(&e));
                return Err(e);
            }
        };
        metrics::record_prediction(prediction.predicted_digit);

        // The pixels were validated before inference, so a rejection here means
        // the model produced an out-of-range result.
        let record = NewDrawing::from_prediction(pixels, &prediction).map_err(|e| {
            metrics::record_prediction_error("inference");
            DigitError::Inference {
                message: e.to_string(),
            }
        })?;
        match self.store.create(record).await {
            Ok(drawing) => {
                metrics::record_drawing_created("predict");
                info!(
                    "Predicted digit {} (confidence {:.3}), stored as drawing {}",
                    prediction.predicted_digit, prediction.confidence, drawing.id
                );
                Ok(prediction)
            }
            Err(e) => {
                metrics::record_persistence_error("create");
                error!("Failed to store prediction: {}", e);
                Err(DigitError::PredictionNotSaved {
                    prediction: Box::new(prediction),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Store a drawing labelled by the caller, without running the model.
    pub async fn record_labelled(&self, pixels: Vec<f64>, digit: u8) -> Result<Drawing> {
        let record = NewDrawing::new(pixels, digit, None, None)?;
        let drawing = self.store.create(record).await.map_err(|e| {
            metrics::record_persistence_error("create");
            e
        })?;
        metrics::record_drawing_created("manual");
        info!("Stored labelled drawing {} (digit {})", drawing.id, digit);
        Ok(drawing)
    }
}

fn error_kind(e: &DigitError) -> &'static str {
    match e {
        DigitError::Validation(_) => "validation",
        DigitError::ModelUnavailable => "model_unavailable",
        _ => "inference",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Page, CLASS_COUNT, PIXEL_COUNT};
    use crate::inference::DigitModel;
    use crate::normalize::{InversionPolicy, StandardNormalizer};
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Predicts the digit nearest to ten times the mean input intensity and
    /// remembers the last input it saw.
    #[derive(Default)]
    struct MeanModel {
        last_input: Mutex<Vec<f32>>,
    }

    impl DigitModel for MeanModel {
        fn infer(&self, input: &[f32]) -> Result<Vec<f32>> {
            *self.last_input.lock().unwrap() = input.to_vec();
            let mean = input.iter().sum::<f32>() / input.len() as f32;
            let digit = ((mean * 9.0).round() as usize).min(CLASS_COUNT - 1);
            let mut out = vec![0.05; CLASS_COUNT];
            out[digit] = 0.55;
            Ok(out)
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DrawingStore for FailingStore {
        async fn create(&self, _drawing: NewDrawing) -> Result<Drawing> {
            Err(DigitError::database("disk full"))
        }
        async fn list(&self, _page: Page) -> Result<Vec<Drawing>> {
            Ok(Vec::new())
        }
        async fn get(&self, id: i64) -> Result<Drawing> {
            Err(DigitError::NotFound(id))
        }
        async fn delete(&self, id: i64) -> Result<()> {
            Err(DigitError::NotFound(id))
        }
    }

    fn pipeline_with(
        model: Arc<MeanModel>,
        store: Arc<dyn DrawingStore>,
    ) -> PredictionPipeline {
        PredictionPipeline::new(
            Arc::new(InferenceAdapter::with_model(model)),
            Arc::new(StandardNormalizer::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_predict_shapes_result_and_stores_raw_pixels() {
        let store = Arc::new(InMemoryStorage::new());
        let pipeline = pipeline_with(Arc::new(MeanModel::default()), store.clone());

        let prediction = pipeline.predict(vec![0.0; PIXEL_COUNT]).await.unwrap();
        let sum: f64 = prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(prediction.predicted_digit, 0);
        assert_eq!(prediction.confidence, 0.55_f32 as f64);

        let stored = store.list(Page::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pixels, vec![0.0; PIXEL_COUNT]);
        assert_eq!(stored[0].predicted_digit, prediction.predicted_digit);
        assert_eq!(stored[0].confidence, Some(prediction.confidence));
        assert_eq!(stored[0].probabilities.as_ref(), Some(&prediction.probabilities));
    }

    #[tokio::test]
    async fn test_stored_pixels_are_pre_normalization() {
        let store = Arc::new(InMemoryStorage::new());
        let model = Arc::new(MeanModel::default());
        let pipeline = pipeline_with(model.clone(), store.clone());

        // Black ink on white paper, 8-bit.
        let mut pixels = vec![255.0; PIXEL_COUNT];
        pixels[0] = 0.0;
        pipeline.predict(pixels.clone()).await.unwrap();

        let seen = model.last_input.lock().unwrap().clone();
        assert_eq!(seen[0], 1.0);
        assert_eq!(seen[1], 0.0);

        let stored = store.list(Page::default()).await.unwrap();
        assert_eq!(stored[0].pixels, pixels);
    }

    #[tokio::test]
    async fn test_wrong_length_is_rejected_and_not_stored() {
        let store = Arc::new(InMemoryStorage::new());
        let model = Arc::new(MeanModel::default());
        let pipeline = pipeline_with(model.clone(), store.clone());

        let err = pipeline.predict(vec![0.0; 100]).await.unwrap_err();
        assert!(matches!(err, DigitError::Validation(_)));
        assert!(model.last_input.lock().unwrap().is_empty());
        assert!(store.list(Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unloaded_model_is_unavailable() {
        let store = Arc::new(InMemoryStorage::new());
        let pipeline = PredictionPipeline::new(
            Arc::new(InferenceAdapter::new()),
            Arc::new(StandardNormalizer::default()),
            store.clone(),
        );

        assert!(!pipeline.model_loaded());
        let err = pipeline.predict(vec![0.0; PIXEL_COUNT]).await.unwrap_err();
        assert!(matches!(err, DigitError::ModelUnavailable));
        assert!(store.list(Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_prediction() {
        let pipeline = pipeline_with(Arc::new(MeanModel::default()), Arc::new(FailingStore));

        match pipeline.predict(vec![0.0; PIXEL_COUNT]).await {
            Err(DigitError::PredictionNotSaved { prediction, message }) => {
                assert_eq!(prediction.predicted_digit, 0);
                assert!(message.contains("disk full"));
            }
            other => panic!("expected PredictionNotSaved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inversion_can_be_disabled() {
        let model = Arc::new(MeanModel::default());
        let pipeline = PredictionPipeline::new(
            Arc::new(InferenceAdapter::with_model(model.clone())),
            Arc::new(StandardNormalizer::new(InversionPolicy::Disabled)),
            Arc::new(InMemoryStorage::new()),
        );

        let prediction = pipeline.classify(&vec![255.0; PIXEL_COUNT]).await.unwrap();
        assert_eq!(prediction.predicted_digit, 9);
        assert!(model.last_input.lock().unwrap().iter().all(|&v| v == 1.0));
    }

    #[tokio::test]
    async fn test_record_labelled_skips_inference() {
        let store = Arc::new(InMemoryStorage::new());
        let model = Arc::new(MeanModel::default());
        let pipeline = pipeline_with(model.clone(), store.clone());

        let drawing = pipeline
            .record_labelled(vec![3.0; PIXEL_COUNT], 7)
            .await
            .unwrap();
        assert_eq!(drawing.predicted_digit, 7);
        assert!(drawing.confidence.is_none());
        assert!(model.last_input.lock().unwrap().is_empty());

        let err = pipeline
            .record_labelled(vec![3.0; PIXEL_COUNT], 12)
            .await
            .unwrap_err();
        assert!(matches!(err, DigitError::Validation(_)));
    }

    /// Softmax head whose top score overshoots one by float error.
    struct OvershootingModel;

    impl DigitModel for OvershootingModel {
        fn infer(&self, _input: &[f32]) -> Result<Vec<f32>> {
            let mut out = vec![0.0; CLASS_COUNT];
            out[5] = 1.0005;
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_predict_stores_overshooting_model_output() {
        let store = Arc::new(InMemoryStorage::new());
        let pipeline = PredictionPipeline::new(
            Arc::new(InferenceAdapter::with_model(Arc::new(OvershootingModel))),
            Arc::new(StandardNormalizer::default()),
            store.clone(),
        );

        let prediction = pipeline.predict(vec![0.0; PIXEL_COUNT]).await.unwrap();
        assert_eq!(prediction.predicted_digit, 5);
        assert!(prediction.confidence <= 1.0);

        let stored = store.list(Page::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].confidence, Some(prediction.confidence));
    }
}
