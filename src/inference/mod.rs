//! Inference domain: scoring requests, the pluggable scorer and the dispatcher
//! that runs them on a bounded worker pool.

pub mod domain;
pub mod service;
pub mod workers;

pub use domain::{
    AnomalyResult, Payload, PredictionResult, RequestKind, ScoreError, ScoreRequest, ScoreResult,
    Scorer, StubScorer,
};
pub use service::{DispatchStats, Dispatcher, Health};
