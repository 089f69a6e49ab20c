//! Request dispatcher bridging async callers and the scoring worker pool.
//!
//! Each call is validated, admitted (or rejected with `Overloaded`), executed
//! on a worker against the current [`Scorer`], and awaited under a timeout.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::common::config::DispatchCfg;
use crate::common::error::{MlError, MlResult};

use super::domain::{
    score_with, AnomalyResult, Payload, PredictionResult, RequestKind, ScoreError, ScoreRequest,
    ScoreResult, Scorer,
};
use super::workers::{Pool, PoolError};

/// Liveness answer; never depends on dispatcher load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of dispatcher activity.
///
/// Outcome counters are not exclusive: a request that times out while still
/// queued counts once in `timed_out` and again in `cancelled` when its worker
/// later skips it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub completed: u64,
    /// Turned away with `Overloaded`.
    pub rejected: u64,
    /// Bodies or payloads rejected as `InvalidInput`.
    pub invalid: u64,
    pub timed_out: u64,
    pub failed: u64,
    /// Extra attempts made for idempotent scorers.
    pub retried: u64,
    /// Queued jobs skipped because nobody was waiting for them any more.
    pub cancelled: u64,
    pub in_flight: usize,
    pub workers: usize,
    pub capacity: usize,
}

pub struct Dispatcher {
    pool: Pool,
    scorer: RwLock<Arc<dyn Scorer>>,
    cfg: DispatchCfg,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(cfg: DispatchCfg, scorer: Arc<dyn Scorer>) -> MlResult<Self> {
        let pool = Pool::new(cfg.workers, cfg.queue_capacity)
            .map_err(|err| MlError::internal(format!("failed to spawn workers: {err}")))?
            .with_shutdown_grace(cfg.shutdown_grace);

        info!(
            workers = pool.workers(),
            capacity = pool.capacity(),
            timeout_ms = cfg.timeout.as_millis() as u64,
            scorer = scorer.name(),
            "dispatcher ready"
        );

        Ok(Self {
            pool,
            scorer: RwLock::new(scorer),
            cfg,
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn health(&self) -> Health {
        Health { status: "healthy" }
    }

    pub async fn predict(&self, payload: Value) -> MlResult<PredictionResult> {
        let payload = self.validate(payload)?;
        self.predict_payload(payload).await
    }

    pub async fn detect_anomaly(&self, payload: Value) -> MlResult<AnomalyResult> {
        let payload = self.validate(payload)?;
        self.detect_anomaly_payload(payload).await
    }

    pub async fn predict_payload(&self, payload: Payload) -> MlResult<PredictionResult> {
        match self.score_payload(RequestKind::Predict, payload).await? {
            ScoreResult::Prediction(result) => Ok(result),
            other => Err(mismatch(RequestKind::Predict, &other)),
        }
    }

    pub async fn detect_anomaly_payload(&self, payload: Payload) -> MlResult<AnomalyResult> {
        match self.score_payload(RequestKind::Anomaly, payload).await? {
            ScoreResult::Anomaly(result) => Ok(result),
            other => Err(mismatch(RequestKind::Anomaly, &other)),
        }
    }

    /// Turn a raw JSON value into a payload, counting rejections.
    pub fn validate(&self, payload: Value) -> MlResult<Payload> {
        Payload::from_value(payload).inspect_err(|_| self.record_invalid())
    }

    /// Count a request rejected before it could become a payload.
    pub fn record_invalid(&self) {
        self.counters.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn score(&self, kind: RequestKind, payload: Value) -> MlResult<ScoreResult> {
        let payload = self.validate(payload)?;
        self.score_payload(kind, payload).await
    }

    /// Admit and execute one validated request.
    ///
    /// Dropping the returned future before it resolves cancels the request if
    /// a worker has not picked it up yet.
    pub async fn score_payload(&self, kind: RequestKind, payload: Payload) -> MlResult<ScoreResult> {
        let request = ScoreRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            payload,
        };
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: ScoreRequest) -> MlResult<ScoreResult> {
        let started = Instant::now();
        let id = request.id;
        let kind = request.kind;
        let scorer = self.current_scorer();
        let attempts = if scorer.idempotent() {
            self.cfg.score_retries.saturating_add(1)
        } else {
            1
        };

        let (tx, rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);
        let submitted = self.pool.try_submit(move || {
            if tx.is_closed() {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = id, "caller gone before execution; skipped");
                return;
            }
            let outcome = execute(scorer.as_ref(), &request, attempts, &counters);
            let _ = tx.send(outcome);
        });

        if let Err(err) = submitted {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = id, %kind, error = %err, "request rejected");
            return Err(match err {
                PoolError::Full { capacity } => MlError::Overloaded { capacity },
                PoolError::Closed => MlError::internal("dispatcher is shutting down"),
            });
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let outcome = match tokio::time::timeout(self.cfg.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MlError::scoring_failed("worker dropped the request")),
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(MlError::Timeout(self.cfg.timeout))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = id, %kind, elapsed_ms, "request scored");
            }
            Err(err) => {
                if matches!(err, MlError::ScoringFailed(_) | MlError::Internal(_)) {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                if matches!(err, MlError::InvalidInput { .. }) {
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                }
                warn!(
                    request_id = id,
                    %kind,
                    elapsed_ms,
                    code = err.code().as_str(),
                    error = %err,
                    "request failed"
                );
            }
        }
        outcome
    }

    /// Swap the scorer; requests already admitted keep the one they started with.
    pub fn replace_scorer(&self, scorer: Arc<dyn Scorer>) {
        info!(scorer = scorer.name(), "scorer replaced");
        *self.scorer.write() = scorer;
    }

    pub fn scorer_name(&self) -> String {
        self.current_scorer().name().to_string()
    }

    fn current_scorer(&self) -> Arc<dyn Scorer> {
        Arc::clone(&self.scorer.read())
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            in_flight: self.pool.in_flight(),
            workers: self.pool.workers(),
            capacity: self.pool.capacity(),
        }
    }
}

fn mismatch(expected: RequestKind, got: &ScoreResult) -> MlError {
    MlError::internal(format!(
        "expected a {expected} result, worker produced {}",
        got.kind()
    ))
}

/// Runs on a worker thread. Panics are caught per attempt so they can be retried.
fn execute(
    scorer: &dyn Scorer,
    request: &ScoreRequest,
    attempts: u32,
    counters: &Counters,
) -> MlResult<ScoreResult> {
    let mut last = ScoreError::failed("no attempt made");
    for attempt in 1..=attempts.max(1) {
        if attempt > 1 {
            counters.retried.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = request.id, attempt, "retrying idempotent scorer");
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            score_with(scorer, request.kind, &request.payload)
        }))
        .unwrap_or_else(|payload| Err(ScoreError::failed(panic_message(payload.as_ref()))));

        match outcome {
            Ok(result) => return result.normalized(),
            Err(err) if err.is_retryable() => last = err,
            Err(err) => return Err(err.into()),
        }
    }
    Err(last.into())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("scorer panicked: {detail}")
}
