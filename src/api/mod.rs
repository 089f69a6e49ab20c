//! Public entry points: the HTTP surface over the dispatcher.

pub mod http;

pub use http::{router, serve, ApiError, ApiState, SERVICE_NAME};
