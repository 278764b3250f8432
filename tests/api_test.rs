use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use digit_recognition::config::CorsOrigins;
use digit_recognition::inference::{DigitModel, InferenceAdapter};
use digit_recognition::normalize::StandardNormalizer;
use digit_recognition::pipeline::PredictionPipeline;
use digit_recognition::server::{create_server, AppState, ServerOptions};
use digit_recognition::storage::{DrawingStore, InMemoryStorage};
use digit_recognition::{Page, CLASS_COUNT, PIXEL_COUNT};

/// Always answers the same digit with 0.9 confidence.
struct ConstantModel(usize);

impl DigitModel for ConstantModel {
    fn infer(&self, _input: &[f32]) -> digit_recognition::Result<Vec<f32>> {
        let mut out = vec![0.1 / 9.0; CLASS_COUNT];
        out[self.0] = 0.9;
        Ok(out)
    }
}

struct TestApp {
    router: Router,
    store: Arc<InMemoryStorage>,
}

fn app_with(adapter: InferenceAdapter, prefix: &str) -> TestApp {
    let store = Arc::new(InMemoryStorage::new());
    let pipeline = PredictionPipeline::new(
        Arc::new(adapter),
        Arc::new(StandardNormalizer::default()),
        store.clone(),
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
        metrics: None,
    };
    let options = ServerOptions {
        api_prefix: prefix.to_string(),
        cors_origins: CorsOrigins::List(vec!["http://localhost:5173".to_string()]),
    };
    TestApp {
        router: create_server(state, &options),
        store,
    }
}

fn app() -> TestApp {
    app_with(
        InferenceAdapter::with_model(Arc::new(ConstantModel(7))),
        "/api",
    )
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    Ok(())
}

#[tokio::test]
async fn test_predict_returns_prediction_and_persists() -> Result<()> {
    let app = app();
    let pixels = vec![0.0; PIXEL_COUNT];

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/predict",
        Some(json!({ "pixels": pixels })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["predicted_digit"], 7);
    let probabilities: Vec<f64> = serde_json::from_value(body["probabilities"].clone())?;
    assert_eq!(probabilities.len(), CLASS_COUNT);
    assert!((probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-4);
    assert_eq!(body["confidence"].as_f64(), Some(probabilities[7]));

    let stored = app.store.list(Page::default()).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].pixels, pixels);
    Ok(())
}

#[tokio::test]
async fn test_predict_rejects_wrong_length() -> Result<()> {
    let app = app();
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/predict",
        Some(json!({ "pixels": vec![0.0; 10] })),
    )
    .await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap_or_default().contains("784"));
    assert!(app.store.list(Page::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_predict_rejects_malformed_body() -> Result<()> {
    let app = app();
    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/predict",
        Some(json!({ "pixels": "not a list" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
async fn test_predict_without_model_is_503() -> Result<()> {
    let app = app_with(InferenceAdapter::new(), "/api");
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/predict",
        Some(json!({ "pixels": vec![0.0; PIXEL_COUNT] })),
    )
    .await?;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].is_string());
    assert!(app.store.list(Page::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_drawing_crud() -> Result<()> {
    let app = app();

    let (status, created) = send(
        &app.router,
        Method::POST,
        "/api/drawings",
        Some(json!({ "pixels": vec![1.0; PIXEL_COUNT], "resultat": 4 })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["predicted_digit"], 4);
    assert!(created["confidence"].is_null());
    assert!(created.get("pixels").is_none());
    let id = created["id"].as_i64().unwrap_or_default();

    let (status, fetched) = send(&app.router, Method::GET, &format!("/api/drawings/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
    assert_eq!(fetched["pixels"].as_array().map(|p| p.len()), Some(PIXEL_COUNT));

    let (status, body) = send(&app.router, Method::DELETE, &format!("/api/drawings/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Drawing deleted successfully");

    let (status, body) = send(&app.router, Method::GET, &format!("/api/drawings/{id}"), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Drawing not found");

    let (status, _) = send(&app.router, Method::DELETE, &format!("/api/drawings/{id}"), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_create_drawing_rejects_invalid_digit() -> Result<()> {
    let app = app();
    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/drawings",
        Some(json!({ "pixels": vec![0.0; PIXEL_COUNT], "predicted_digit": 11 })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
async fn test_list_is_newest_first_and_paginated() -> Result<()> {
    let app = app();
    for digit in [1, 2, 3] {
        let (status, _) = send(
            &app.router,
            Method::POST,
            "/api/drawings",
            Some(json!({ "pixels": vec![0.0; PIXEL_COUNT], "predicted_digit": digit })),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, all) = send(&app.router, Method::GET, "/api/drawings", None).await?;
    assert_eq!(status, StatusCode::OK);
    let digits: Vec<i64> = all
        .as_array()
        .map(|a| a.iter().filter_map(|d| d["predicted_digit"].as_i64()).collect())
        .unwrap_or_default();
    assert_eq!(digits, vec![3, 2, 1]);
    assert!(all[0].get("pixels").is_none());

    let (_, latest) = send(&app.router, Method::GET, "/api/drawings?limit=1", None).await?;
    assert_eq!(latest.as_array().map(|a| a.len()), Some(1));
    assert_eq!(latest[0]["predicted_digit"], 3);

    let (_, second) = send(&app.router, Method::GET, "/api/drawings?limit=1&offset=1", None).await?;
    assert_eq!(second[0]["predicted_digit"], 2);

    let (status, _) = send(&app.router, Method::GET, "/api/drawings?limit=-1", None).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
async fn test_routes_can_be_mounted_at_root() -> Result<()> {
    let app = app_with(
        InferenceAdapter::with_model(Arc::new(ConstantModel(2))),
        "",
    );
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/predict",
        Some(json!({ "pixels": vec![255.0; PIXEL_COUNT] })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["predicted_digit"], 2);

    let (status, _) = send(&app.router, Method::GET, "/drawings", None).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_metrics_disabled_is_404() -> Result<()> {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}
