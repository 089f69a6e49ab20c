//! Shared utilities that glue the dispatcher and the HTTP surface together.
pub mod config;
pub mod error;
pub mod log;

pub use config::{AppCfg, ConfigError, DispatchCfg, LogCfg};
pub use error::{ErrorCode, MlError, MlResult};
