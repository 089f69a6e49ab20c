use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use ml_services::api::{self, ApiState};
use ml_services::common::{log, AppCfg};
use ml_services::inference::{Dispatcher, StubScorer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppCfg::load().context("loading configuration")?;
    log::init(&cfg.log);

    let addr = cfg.bind_addr()?;
    let dispatcher = Dispatcher::new(cfg.dispatch.clone(), Arc::new(StubScorer::default()))?;
    let state = ApiState::new(Arc::new(dispatcher)).with_max_body_bytes(cfg.max_body_bytes);

    info!(port = cfg.port, "starting {}", api::SERVICE_NAME);
    api::serve(addr, state).await
}
