//! Default consumers of sync events: status lines go to the log and uploads
//! are handed to background tasks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use pumpsync_core::{Notifier, StatusKind, UploadDispatcher, UploadTarget};

/// Writes status lines to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_status(&self, kind: StatusKind, text: &str) {
        match kind {
            StatusKind::Warning => warn!(target: "pumpsync::status", "{}", text),
            StatusKind::Help | StatusKind::Setting => {
                debug!(target: "pumpsync::status", ?kind, "{}", text)
            }
            _ => info!(target: "pumpsync::status", ?kind, "{}", text),
        }
    }
}

/// Runs each upload after its delay on a tracked task.
///
/// A target with an upload already pending is not scheduled again. Completed
/// uploads are reported on the optional sink channel.
#[derive(Debug, Clone)]
pub struct LogUploadDispatcher {
    pending: Arc<Mutex<HashSet<UploadTarget>>>,
    tracker: TaskTracker,
    sink: Option<mpsc::UnboundedSender<UploadTarget>>,
}

impl Default for LogUploadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogUploadDispatcher {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            sink: None,
        }
    }

    /// Report every completed upload on `sink`.
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<UploadTarget>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Targets with an upload waiting for its delay.
    pub fn pending(&self) -> Vec<UploadTarget> {
        lock(&self.pending).iter().copied().collect()
    }

    /// Stop accepting uploads and wait for the pending ones to run.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn lock(pending: &Mutex<HashSet<UploadTarget>>) -> MutexGuard<'_, HashSet<UploadTarget>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UploadDispatcher for LogUploadDispatcher {
    fn schedule_upload(&self, target: UploadTarget, after: Duration) {
        if self.tracker.is_closed() {
            warn!(%target, "Upload dispatcher closed, upload dropped");
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(%target, "No runtime to schedule the upload on");
            return;
        }
        if !lock(&self.pending).insert(target) {
            debug!(%target, "Upload already pending");
            return;
        }

        let pending = Arc::clone(&self.pending);
        let sink = self.sink.clone();
        self.tracker.spawn(async move {
            tokio::time::sleep(after).await;
            lock(&pending).remove(&target);
            info!(%target, "Upload to {} started", target);
            if let Some(sink) = sink {
                let _ = sink.send(target);
            }
        });
    }
}
