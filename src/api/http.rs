//! HTTP surface: health, scoring and stats routes over a shared dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::common::config::DEFAULT_MAX_BODY_BYTES;
use crate::common::error::{ErrorCode, MlError};
use crate::inference::{DispatchStats, Dispatcher, Payload};

pub const SERVICE_NAME: &str = "ml-services";

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub max_body_bytes: usize,
}

impl ApiState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    prediction: String,
    confidence: f64,
    input_processed: Payload,
}

#[derive(Debug, Serialize)]
struct AnomalyResponse {
    is_anomaly: bool,
    score: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

/// Dispatcher errors rendered as JSON with the matching status code.
#[derive(Debug)]
pub struct ApiError(pub MlError);

impl From<MlError> for ApiError {
    fn from(err: MlError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ScoringFailed | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let body = ErrorBody {
            error: code.as_str(),
            field: self.0.field().map(str::to_string),
            message: self.0.to_string(),
        };
        (status_for(code), Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/anomaly", post(anomaly))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "{SERVICE_NAME} listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Bodies are parsed as JSON whatever the declared content type.
fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.is_empty() {
        return Err(MlError::invalid("request body is empty").into());
    }
    serde_json::from_slice(body)
        .map_err(|err| MlError::invalid(format!("request body is not valid JSON: {err}")).into())
}

/// Every rejected body lands in the dispatcher's `invalid` counter.
fn parse_payload(dispatcher: &Dispatcher, body: &Bytes) -> Result<Payload, ApiError> {
    let value = parse_body(body).inspect_err(|_| dispatcher.record_invalid())?;
    Ok(dispatcher.validate(value)?)
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let health = state.dispatcher.health();
    Json(HealthResponse {
        status: health.status,
        service: SERVICE_NAME,
    })
}

async fn predict(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<PredictResponse>, ApiError> {
    let payload = parse_payload(&state.dispatcher, &body)?;
    let result = state.dispatcher.predict_payload(payload.clone()).await?;

    Ok(Json(PredictResponse {
        prediction: result.label,
        confidence: result.confidence,
        input_processed: payload,
    }))
}

async fn anomaly(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<AnomalyResponse>, ApiError> {
    let payload = parse_payload(&state.dispatcher, &body)?;
    let result = state.dispatcher.detect_anomaly_payload(payload).await?;

    Ok(Json(AnomalyResponse {
        is_anomaly: result.is_anomaly,
        score: result.score,
    }))
}

async fn stats(State(state): State<ApiState>) -> Json<DispatchStats> {
    Json(state.dispatcher.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::Overloaded), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorCode::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorCode::ScoringFailed),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn empty_and_garbage_bodies_are_invalid() {
        let err = parse_body(&Bytes::new()).unwrap_err();
        assert_eq!(err.0.code(), ErrorCode::InvalidInput);
        let err = parse_body(&Bytes::from_static(b"{not json")).unwrap_err();
        assert_eq!(err.0.code(), ErrorCode::InvalidInput);
        assert!(parse_body(&Bytes::from_static(b"[1]")).is_ok());
    }
}
