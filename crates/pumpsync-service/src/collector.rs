//! Background sync loop.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pumpsync_core::{
    CycleOutcome, DeviceLink, Notifier, PersistentStore, SyncOrchestrator, UploadDispatcher,
    WakeScheduler, forward_events,
};

use crate::wake::TokioWakeScheduler;

/// Runs a sync cycle every time the wake timer fires.
pub struct Collector<L, S> {
    orchestrator: SyncOrchestrator<L, S, TokioWakeScheduler>,
}

impl<L, S> Collector<L, S>
where
    L: DeviceLink,
    S: PersistentStore,
{
    /// Create a new collector.
    pub fn new(orchestrator: SyncOrchestrator<L, S, TokioWakeScheduler>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator<L, S, TokioWakeScheduler> {
        &self.orchestrator
    }

    /// Route this collector's events to `notifier` and `uploader` on a
    /// background task. The task ends when the collector is dropped.
    pub fn spawn_forwarder<N, U>(&self, notifier: Arc<N>, uploader: Arc<U>) -> JoinHandle<()>
    where
        N: Notifier + 'static,
        U: UploadDispatcher + 'static,
    {
        tokio::spawn(forward_events(
            self.orchestrator.subscribe(),
            notifier,
            uploader,
        ))
    }

    /// Run one cycle now.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let outcome = self.orchestrator.run_cycle(OffsetDateTime::now_utc()).await;
        log_outcome(&outcome);
        outcome
    }

    /// Poll immediately, then whenever the wake timer fires, until `stop` is
    /// cancelled. A cycle in progress always completes.
    pub async fn run(&mut self, stop: CancellationToken) {
        info!("Starting collector");
        self.orchestrator.wake().arm_at(OffsetDateTime::now_utc());

        loop {
            let armed_for = tokio::select! {
                _ = stop.cancelled() => break,
                at = self.orchestrator.wake().fired() => at,
            };
            debug!(%armed_for, "Wake fired");
            self.run_once().await;
        }

        info!("Collector stopped");
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    if outcome.busy {
        debug!(next_wake = %outcome.next_wake, "Pump busy, poll deferred");
    } else if let Some(error) = &outcome.error {
        warn!(
            next_wake = %outcome.next_wake,
            failed_at = ?outcome.failed_at,
            "Sync cycle failed: {}",
            error
        );
    } else {
        info!(
            next_wake = %outcome.next_wake,
            warnings = outcome.warnings.len(),
            "Sync cycle complete"
        );
    }
}
