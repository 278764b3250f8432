use crate::config::CorsOrigins;
use crate::domain::{Drawing, Page, Prediction};
use crate::error::DigitError;
use crate::pipeline::PredictionPipeline;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PredictionPipeline>,
    pub metrics: Option<PrometheusHandle>,
}

/// Router settings that don't belong to the pipeline.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub api_prefix: String,
    pub cors_origins: CorsOrigins,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            api_prefix: crate::config::DEFAULT_API_PREFIX.to_string(),
            cors_origins: CorsOrigins::Any,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub pixels: Vec<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDrawingRequest {
    pub pixels: Vec<f64>,
    #[serde(alias = "resultat")]
    pub predicted_digit: u8,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Listing view of a drawing, without the pixel data.
#[derive(Debug, Serialize, Deserialize)]
pub struct DrawingSummary {
    pub id: i64,
    pub predicted_digit: u8,
    pub confidence: Option<f64>,
    pub probabilities: Option<Vec<f64>>,
    pub created_at: DateTime<Utc>,
}

impl From<Drawing> for DrawingSummary {
    fn from(d: Drawing) -> Self {
        Self {
            id: d.id,
            predicted_digit: d.predicted_digit,
            confidence: d.confidence,
            probabilities: d.probabilities,
            created_at: d.created_at,
        }
    }
}

/// Error wrapper that renders `{"detail": ...}` with a matching status code.
pub struct ApiError(DigitError);

impl From<DigitError> for ApiError {
    fn from(e: DigitError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(DigitError::Validation(e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError(DigitError::Validation(e.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        ApiError(DigitError::Validation(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.0.to_string();
        match self.0 {
            DigitError::Validation(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "detail": detail }))).into_response()
            }
            DigitError::NotFound(_) => {
                (StatusCode::NOT_FOUND, Json(json!({ "detail": "Drawing not found" }))).into_response()
            }
            DigitError::ModelUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "detail": detail }))).into_response()
            }
            DigitError::PredictionNotSaved { prediction, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": detail, "prediction": prediction })),
            )
                .into_response(),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": detail })))
                .into_response(),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn predict(
    State(state): State<AppState>,
    payload: std::result::Result<Json<PredictRequest>, JsonRejection>,
) -> ApiResult<Json<Prediction>> {
    let Json(req) = payload?;
    let prediction = state.pipeline.predict(req.pixels).await?;
    Ok(Json(prediction))
}

async fn create_drawing(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateDrawingRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DrawingSummary>)> {
    let Json(req) = payload?;
    let drawing = state
        .pipeline
        .record_labelled(req.pixels, req.predicted_digit)
        .await?;
    Ok((StatusCode::CREATED, Json(drawing.into())))
}

async fn list_drawings(
    State(state): State<AppState>,
    params: std::result::Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Vec<DrawingSummary>>> {
    let Query(params) = params?;
    let page = Page::new(params.limit, params.offset);
    let drawings = state.pipeline.store().list(page).await?;
    Ok(Json(drawings.into_iter().map(DrawingSummary::from).collect()))
}

async fn get_drawing(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Drawing>> {
    let Path(id) = id?;
    let drawing = state.pipeline.store().get(id).await?;
    Ok(Json(drawing))
}

async fn delete_drawing(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Path(id) = id?;
    state.pipeline.store().delete(id).await?;
    crate::metrics::record_drawing_deleted();
    info!("Deleted drawing {}", id);
    Ok(Json(json!({ "message": "Drawing deleted successfully" })))
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    let allow_origin = match origins {
        CorsOrigins::Any => AllowOrigin::any(),
        CorsOrigins::List(list) => {
            let values: Vec<HeaderValue> = list
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!("Ignoring invalid CORS origin '{}'", o);
                        None
                    }
                })
                .collect();
            AllowOrigin::list(values)
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

/// Create the HTTP router with all routes
pub fn create_server(state: AppState, options: &ServerOptions) -> Router {
    let api = Router::new()
        .route("/predict", post(predict))
        .route("/drawings", get(list_drawings).post(create_drawing))
        .route("/drawings/:id", get(get_drawing).delete(delete_drawing));

    let router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler));

    let router = if options.api_prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(&options.api_prefix, api)
    };

    router.with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&options.cors_origins)),
    )
}

/// Start the HTTP server and serve until ctrl-c.
pub async fn start_server(
    state: AppState,
    options: &ServerOptions,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let app = create_server(state, options);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("🚀 HTTP server running on http://{addr}");
    println!("💚 Health check: http://{addr}/health");
    println!("🔢 Predict:      http://{addr}{}/predict", options.api_prefix);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
