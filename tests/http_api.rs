//! HTTP contract tests for the scoring service.
//!
//! Each test builds a router over its own dispatcher and drives it in-process.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use ml_services::api::{router, ApiState};
use ml_services::common::DispatchCfg;
use ml_services::inference::{
    AnomalyResult, Dispatcher, Payload, PredictionResult, ScoreError, Scorer, StubScorer,
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn dispatch_cfg(workers: usize, queue_capacity: usize, timeout_ms: u64) -> DispatchCfg {
    DispatchCfg {
        workers,
        queue_capacity,
        timeout: Duration::from_millis(timeout_ms),
        score_retries: 0,
        shutdown_grace: Duration::from_secs(5),
    }
}

fn app_with(scorer: Arc<dyn Scorer>, cfg: DispatchCfg) -> Router {
    let dispatcher = Dispatcher::new(cfg, scorer).unwrap();
    router(ApiState::new(Arc::new(dispatcher)))
}

fn stub_app() -> Router {
    app_with(Arc::new(StubScorer::default()), dispatch_cfg(2, 8, 1_000))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

struct SlowScorer(Duration);

impl Scorer for SlowScorer {
    fn predict(&self, _: &Payload) -> Result<PredictionResult, ScoreError> {
        thread::sleep(self.0);
        Ok(PredictionResult {
            label: "late".into(),
            confidence: 0.4,
        })
    }

    fn detect_anomaly(&self, _: &Payload) -> Result<AnomalyResult, ScoreError> {
        thread::sleep(self.0);
        Ok(AnomalyResult {
            is_anomaly: false,
            score: 0.1,
        })
    }
}

struct BrokenScorer;

impl Scorer for BrokenScorer {
    fn predict(&self, payload: &Payload) -> Result<PredictionResult, ScoreError> {
        if payload.get("features").is_none() {
            return Err(ScoreError::invalid_field("features", "required"));
        }
        Err(ScoreError::failed("model file is corrupt"))
    }

    fn detect_anomaly(&self, _: &Payload) -> Result<AnomalyResult, ScoreError> {
        panic!("anomaly model not loaded");
    }
}

#[tokio::test]
async fn health_reports_service_name() {
    let (status, json) = send(&stub_app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"status": "healthy", "service": "ml-services"}));
}

#[tokio::test]
async fn predict_echoes_processed_input() {
    let (status, json) = send(&stub_app(), post("/predict", r#"{"x": 1}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json,
        json!({"prediction": "positive", "confidence": 0.85, "input_processed": {"x": 1}})
    );
}

#[tokio::test]
async fn predict_keeps_unknown_keys() {
    let body = r#"{"x": 1, "meta": {"source": "batch", "tags": ["a", "b"]}}"#;
    let (status, json) = send(&stub_app(), post("/predict", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["input_processed"]["meta"]["tags"], json!(["a", "b"]));
    let confidence = json["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));
}

#[tokio::test]
async fn anomaly_returns_flag_and_score() {
    let (status, json) = send(&stub_app(), post("/anomaly", r#"{"value": 42}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"is_anomaly": false, "score": 0.12}));
}

#[tokio::test]
async fn non_object_payloads_are_bad_requests() {
    let app = stub_app();
    for uri in ["/predict", "/anomaly"] {
        for body in [r#""just a string""#, "[1, 2, 3]", "17", "null", "{broken", ""] {
            let (status, json) = send(&app, post(uri, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} with {body:?}");
            assert_eq!(json["error"], "invalid_input");
        }
    }
}

#[tokio::test]
async fn content_type_is_not_required() {
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .body(Body::from(r#"{"x": 2}"#))
        .unwrap();
    let (status, json) = send(&stub_app(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["input_processed"], json!({"x": 2}));
}

#[tokio::test]
async fn scorer_field_error_is_reported_with_field() {
    let app = app_with(Arc::new(BrokenScorer), dispatch_cfg(1, 2, 1_000));
    let (status, json) = send(&app, post("/predict", r#"{"x": 1}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_input");
    assert_eq!(json["field"], "features");
}

#[tokio::test]
async fn scorer_failures_and_panics_are_server_errors() {
    let app = app_with(Arc::new(BrokenScorer), dispatch_cfg(1, 2, 1_000));

    let (status, json) = send(&app, post("/predict", r#"{"features": [1.0]}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "scoring_failed");

    let (status, json) = send(&app, post("/anomaly", r#"{"features": [1.0]}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "scoring_failed");
    assert!(json["message"].as_str().unwrap().contains("anomaly model not loaded"));

    // The worker that caught the panic is still serving.
    let (status, _) = send(&app, post("/predict", r#"{"features": [1.0]}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn slow_scorer_yields_gateway_timeout() {
    let app = app_with(
        Arc::new(SlowScorer(Duration::from_millis(400))),
        dispatch_cfg(1, 0, 50),
    );
    let (status, json) = send(&app, post("/anomaly", "{}")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json["error"], "timeout");
}

#[tokio::test]
async fn saturation_yields_service_unavailable_while_health_stays_up() {
    let app = app_with(
        Arc::new(SlowScorer(Duration::from_millis(300))),
        dispatch_cfg(1, 1, 2_000),
    );

    let busy: Vec<_> = (0..2)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { send(&app, post("/predict", "{}")).await })
        })
        .collect();

    // Wait until both slots are taken.
    for _ in 0..100 {
        let (_, stats) = send(&app, get("/stats")).await;
        if stats["in_flight"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, json) = send(&app, post("/predict", "{}")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], "overloaded");

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    for handle in busy {
        let (status, _) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn stats_count_outcomes() {
    let app = stub_app();
    send(&app, post("/predict", r#"{"a": 1}"#)).await;
    send(&app, post("/anomaly", r#"{"a": 1}"#)).await;
    send(&app, post("/predict", "[]")).await;
    send(&app, post("/anomaly", "{broken")).await;
    send(&app, post("/predict", "")).await;

    let (status, stats) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["completed"], 2);
    assert_eq!(stats["invalid"], 3);
    assert_eq!(stats["workers"], 2);
    assert_eq!(stats["capacity"], 10);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let dispatcher = Dispatcher::new(dispatch_cfg(1, 1, 1_000), Arc::new(StubScorer::default())).unwrap();
    let app = router(ApiState::new(Arc::new(dispatcher)).with_max_body_bytes(16));

    let body = format!(r#"{{"blob": "{}"}}"#, "x".repeat(64));
    let (status, _) = send(&app, post("/predict", &body)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (status, _) = send(&stub_app(), get("/train")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
