use crate::domain::Prediction;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigitError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Drawing {0} not found")]
    NotFound(i64),

    #[error("Model not loaded")]
    ModelUnavailable,

    #[error("Failed to load model: {message}")]
    ModelLoad { message: String },

    #[error("Inference failed: {message}")]
    Inference { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    /// The model produced a prediction but the drawing could not be stored.
    #[error("Prediction computed but not saved: {message}")]
    PredictionNotSaved {
        prediction: Box<Prediction>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DigitError {
    pub fn database(message: impl Into<String>) -> Self {
        DigitError::Database {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DigitError>;
