// lib.rs - model-serving request dispatcher
pub mod api;
pub mod common;
pub mod inference;

pub use common::{AppCfg, ErrorCode, MlError, MlResult};
pub use inference::{Dispatcher, Scorer, StubScorer};
