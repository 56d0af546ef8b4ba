//! Outbound sync events.
//!
//! The orchestrator never talks to the notifier or the upload dispatcher
//! directly. It publishes [`SyncEvent`]s on a broadcast channel and
//! [`forward_events`] hands them to the consumers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::settings::UploadTarget;
use crate::traits::{Notifier, UploadDispatcher};

/// Category of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Info,
    Warning,
    /// Suggested action following a warning.
    Help,
    /// Sensor state.
    Cgm,
    /// Finger BG, bolus or basal event.
    Treatment,
    /// Consumable change window.
    Note,
    /// Effective setting for this cycle.
    Setting,
}

/// Events emitted by a sync cycle.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A human-readable status line.
    Status { kind: StatusKind, text: String },
    /// A new snapshot was committed for a pump.
    PumpUpdated {
        pump_mac: u64,
        #[serde(with = "time::serde::rfc3339")]
        event_time: OffsetDateTime,
    },
    /// Access to the USB bridge must be granted by the user.
    PermissionRequired { reason: String },
    /// Results should be uploaded to a downstream target.
    UploadRequested { target: UploadTarget, delay_ms: u64 },
}

impl SyncEvent {
    /// Create a status event.
    pub fn status(kind: StatusKind, text: impl Into<String>) -> Self {
        SyncEvent::Status {
            kind,
            text: text.into(),
        }
    }
}

/// Sender for sync events.
pub type EventSender = broadcast::Sender<SyncEvent>;

/// Receiver for sync events.
pub type EventReceiver = broadcast::Receiver<SyncEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SyncEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Send a status line.
    pub fn status(&self, kind: StatusKind, text: impl Into<String>) {
        self.send(SyncEvent::status(kind, text));
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Route events to the notifier and upload dispatcher until the channel
/// closes.
pub async fn forward_events<N, U>(mut receiver: EventReceiver, notifier: Arc<N>, uploader: Arc<U>)
where
    N: Notifier + ?Sized,
    U: UploadDispatcher + ?Sized,
{
    loop {
        match receiver.recv().await {
            Ok(SyncEvent::Status { kind, text }) => notifier.send_status(kind, &text),
            Ok(SyncEvent::PermissionRequired { reason }) => {
                notifier.send_status(
                    StatusKind::Warning,
                    &format!("Permission required for the bridge: {}", reason),
                );
            }
            Ok(SyncEvent::UploadRequested { target, delay_ms }) => {
                uploader.schedule_upload(target, std::time::Duration::from_millis(delay_ms));
            }
            Ok(SyncEvent::PumpUpdated {
                pump_mac,
                event_time,
            }) => {
                debug!(pump = pump_mac & 0xFF_FFFF, %event_time, "Pump updated");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
