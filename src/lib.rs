//! Handwritten digit recognition service.
//!
//! A submitted 28x28 grid goes through [`normalize`], is classified by the
//! model held in [`inference`], and is stored by a [`storage::DrawingStore`].
//! [`pipeline`] ties those together and [`server`] exposes them over HTTP.

pub mod config;
#[cfg(feature = "db")]
pub mod db;
pub mod domain;
pub mod error;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod server;
pub mod storage;

pub use domain::{Drawing, NewDrawing, Page, Prediction, CLASS_COUNT, PIXEL_COUNT};
pub use error::{DigitError, Result};
