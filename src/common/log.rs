//! Logging setup emitting JSON lines (or human-readable output for local runs).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::config::LogCfg;

/// Install the global `tracing` subscriber. Later calls are no-ops.
pub fn init(cfg: &LogCfg) {
    let filter = EnvFilter::try_new(&cfg.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if cfg.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(filter = %cfg.filter, json = cfg.json, "logging initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_does_not_panic() {
        let cfg = LogCfg {
            filter: "not a [valid filter".to_string(),
            json: false,
        };
        init(&cfg);
        init(&LogCfg::default());
    }
}
