//! Domain definitions for scoring requests, results and the scorer capability.
//!
//! Request payloads arrive as schema-less JSON and only become a typed
//! [`ScoreRequest`] once they have been validated.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::common::error::{MlError, MlResult};

/// Validated request body: a JSON object whose keys are passed through untouched.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(Arc<Map<String, Value>>);

impl Payload {
    /// Accept any JSON object; everything else is `InvalidInput`.
    pub fn from_value(value: Value) -> MlResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(Arc::new(map))),
            other => Err(MlError::invalid(format!(
                "payload must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Which scorer operation a request targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RequestKind {
    Predict,
    Anomaly,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Predict => "predict",
            RequestKind::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request owned by the dispatcher for the duration of one call.
#[derive(Clone, Debug)]
pub struct ScoreRequest {
    pub id: u64,
    pub kind: RequestKind,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictionResult {
    pub label: String,
    /// Always within `[0, 1]` once it leaves the dispatcher.
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    /// Always within `[0, 1]` once it leaves the dispatcher.
    pub score: f64,
}

/// Exactly one of these is produced per accepted request.
#[derive(Clone, Debug, PartialEq)]
pub enum ScoreResult {
    Prediction(PredictionResult),
    Anomaly(AnomalyResult),
}

impl ScoreResult {
    pub fn kind(&self) -> RequestKind {
        match self {
            ScoreResult::Prediction(_) => RequestKind::Predict,
            ScoreResult::Anomaly(_) => RequestKind::Anomaly,
        }
    }

    /// Clamp finite probabilities into `[0, 1]` and reject NaN or infinities.
    pub fn normalized(self) -> MlResult<Self> {
        match self {
            ScoreResult::Prediction(mut p) => {
                p.confidence = unit_interval("confidence", p.confidence)?;
                Ok(ScoreResult::Prediction(p))
            }
            ScoreResult::Anomaly(mut a) => {
                a.score = unit_interval("score", a.score)?;
                Ok(ScoreResult::Anomaly(a))
            }
        }
    }
}

fn unit_interval(name: &str, value: f64) -> MlResult<f64> {
    if value.is_finite() {
        Ok(value.clamp(0.0, 1.0))
    } else {
        Err(MlError::scoring_failed(format!(
            "scorer returned non-finite {name}"
        )))
    }
}

/// Failure reported by a scorer implementation.
#[derive(Clone, Debug, PartialEq)]
pub enum ScoreError {
    /// The payload lacks something the scorer needs.
    InvalidField { field: String, reason: String },
    /// Anything else that went wrong inside the scorer.
    Failed(String),
}

impl ScoreError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ScoreError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ScoreError::Failed(message.into())
    }

    /// Input problems are never worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScoreError::Failed(_))
    }
}

impl From<ScoreError> for MlError {
    fn from(err: ScoreError) -> Self {
        match err {
            ScoreError::InvalidField { field, reason } => MlError::invalid_field(field, reason),
            ScoreError::Failed(message) => MlError::ScoringFailed(message),
        }
    }
}

/// Pluggable backend performing prediction and anomaly detection.
///
/// Implementations are shared across worker threads and invoked concurrently
/// without locking, so they must be safe for re-entrant use.
pub trait Scorer: Send + Sync {
    fn predict(&self, payload: &Payload) -> Result<PredictionResult, ScoreError>;

    fn detect_anomaly(&self, payload: &Payload) -> Result<AnomalyResult, ScoreError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "scorer"
    }

    /// Repeating a call has no side effects, so failed attempts may be retried.
    fn idempotent(&self) -> bool {
        false
    }
}

/// Run the scorer operation selected by `kind`.
pub fn score_with(scorer: &dyn Scorer, kind: RequestKind, payload: &Payload) -> Result<ScoreResult, ScoreError> {
    match kind {
        RequestKind::Predict => scorer.predict(payload).map(ScoreResult::Prediction),
        RequestKind::Anomaly => scorer.detect_anomaly(payload).map(ScoreResult::Anomaly),
    }
}

/// Fixed-answer scorer standing in until a real model is wired in.
#[derive(Clone, Debug)]
pub struct StubScorer {
    pub label: String,
    pub confidence: f64,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
}

impl Default for StubScorer {
    fn default() -> Self {
        Self {
            label: "positive".to_string(),
            confidence: 0.85,
            is_anomaly: false,
            anomaly_score: 0.12,
        }
    }
}

impl Scorer for StubScorer {
    fn predict(&self, _: &Payload) -> Result<PredictionResult, ScoreError> {
        Ok(PredictionResult {
            label: self.label.clone(),
            confidence: self.confidence,
        })
    }

    fn detect_anomaly(&self, _: &Payload) -> Result<AnomalyResult, ScoreError> {
        Ok(AnomalyResult {
            is_anomaly: self.is_anomaly,
            score: self.anomaly_score,
        })
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn idempotent(&self) -> bool {
        true
    }
}
