//! One-shot wake timer backed by the tokio clock.

use std::time::Duration as StdDuration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

use pumpsync_core::WakeScheduler;

/// Wake timer holding at most one pending wake.
///
/// [`WakeScheduler::arm_at`] replaces the pending wake; [`TokioWakeScheduler::fired`]
/// resolves once the pending wake is reached and clears it.
#[derive(Debug)]
pub struct TokioWakeScheduler {
    pending: watch::Sender<Option<OffsetDateTime>>,
}

impl Default for TokioWakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioWakeScheduler {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(None);
        Self { pending }
    }

    /// The wake currently armed, if any.
    pub fn pending(&self) -> Option<OffsetDateTime> {
        *self.pending.borrow()
    }

    /// Wait for the pending wake and return the instant it was armed for.
    ///
    /// Waits indefinitely while nothing is armed. A wake in the past fires
    /// immediately.
    pub async fn fired(&self) -> OffsetDateTime {
        let mut rx = self.pending.subscribe();
        loop {
            let armed = *rx.borrow_and_update();
            let Some(at) = armed else {
                // The sender lives in `self`, so the channel cannot close here.
                let _ = rx.changed().await;
                continue;
            };

            let delay = StdDuration::try_from(at - OffsetDateTime::now_utc())
                .unwrap_or(StdDuration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let fired = self.pending.send_if_modified(|pending| {
                        if *pending == Some(at) {
                            *pending = None;
                            true
                        } else {
                            false
                        }
                    });
                    if fired {
                        return at;
                    }
                }
                _ = rx.changed() => {}
            }
        }
    }
}

impl WakeScheduler for TokioWakeScheduler {
    fn arm_at(&self, at: OffsetDateTime) {
        debug!(%at, "Wake armed");
        self.pending.send_replace(Some(at));
    }
}
