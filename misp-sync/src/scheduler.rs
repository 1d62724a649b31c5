//! Periodic tick, readiness gate, and stop-hook registration (spec
//! §4.7). The platform's "migration state" readiness predicate and
//! lifecycle "stop-hook" become a plain closure and a `tokio::sync::watch`
//! cancellation channel respectively — the idiomatic expression spec §9
//! calls for in place of the original's implicit process wiring.

use crate::ingestion::IngestionPipeline;
use crate::store::TempStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Scheduler {
    pipeline: Arc<IngestionPipeline>,
    temp: Arc<dyn TempStore>,
    readiness: Arc<dyn Fn() -> bool + Send + Sync>,
    interval: Duration,
}

pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Cancels the scheduler. The in-flight tick, if any, is allowed to
    /// complete; there is no hard preemption.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        temp: Arc<dyn TempStore>,
        readiness: Arc<dyn Fn() -> bool + Send + Sync>,
        interval: Duration,
    ) -> Self {
        Self { pipeline, temp, readiness, interval }
    }

    pub fn spawn(self) -> (JoinHandle<()>, StopHandle) {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *rx.borrow() {
                            break;
                        }
                        self.run_tick().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("scheduler stop-hook fired, exiting");
                            break;
                        }
                    }
                }
            }
        });
        (handle, StopHandle { tx })
    }

    async fn run_tick(&self) {
        if !(self.readiness)() {
            info!("platform not ready (migration in progress), skipping tick");
            return;
        }

        let outcomes = self.pipeline.synchronize().await;
        for (instance, events) in &outcomes {
            let failures = events.iter().filter(|o| matches!(o, crate::ingestion::EventOutcome::Failure(_))).count();
            info!(instance, total = events.len(), failures, "synchronization tick complete for instance");
        }

        if let Err(e) = self.temp.release_all() {
            warn!(error = %e, "failed to release temp files after tick");
        }
    }
}
