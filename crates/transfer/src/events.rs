//! Outbound notifications.
//!
//! Sinks are called from worker tasks with no threading guarantee. Callers
//! that need delivery on a particular thread (a UI loop, say) marshal it
//! themselves, typically through [`ChannelSink`].

use std::fmt;

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use crate::ItemId;

/// Why an item ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Stopped by [`CancellationController::request_cancel`](crate::CancellationController::request_cancel).
    Cancelled,
    /// Any other failure, with a human-readable message.
    Error(String),
}

impl FailureReason {
    /// Stable reason text for cancelled items.
    pub const CANCELLED: &'static str = "transfer cancelled";

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Cancelled => Self::CANCELLED,
            Self::Error(msg) => msg,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Observer of transfer state.
pub trait EventSink: Send + Sync {
    /// Progress for an in-flight item. `percent` is `None` while the size is unknown.
    fn on_progress(&self, id: ItemId, percent: Option<u8>, speed: f64);

    /// The item finished; its output is in place.
    fn on_completed(&self, id: ItemId);

    /// The item ended without completing.
    fn on_failed(&self, id: ItemId, reason: &FailureReason);
}

/// A notification as a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress {
        id: ItemId,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        speed: f64,
    },
    Completed {
        id: ItemId,
    },
    Failed {
        id: ItemId,
        reason: FailureReason,
        cancelled: bool,
    },
}

impl TransferEvent {
    pub fn id(&self) -> ItemId {
        match self {
            Self::Progress { id, .. } | Self::Completed { id } | Self::Failed { id, .. } => *id,
        }
    }

    /// Returns `true` for completion and failure events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Forwards notifications as [`TransferEvent`]s over an unbounded channel.
///
/// Events for one item arrive in the order they were emitted.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TransferEvent) {
        // The receiver going away only means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_progress(&self, id: ItemId, percent: Option<u8>, speed: f64) {
        self.send(TransferEvent::Progress { id, percent, speed });
    }

    fn on_completed(&self, id: ItemId) {
        self.send(TransferEvent::Completed { id });
    }

    fn on_failed(&self, id: ItemId, reason: &FailureReason) {
        self.send(TransferEvent::Failed {
            id,
            reason: reason.clone(),
            cancelled: reason.is_cancelled(),
        });
    }
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_progress(&self, id: ItemId, percent: Option<u8>, speed: f64) {
        tracing::debug!(item = %id, ?percent, speed, "transfer progress");
    }

    fn on_completed(&self, id: ItemId) {
        tracing::info!(item = %id, "transfer completed");
    }

    fn on_failed(&self, id: ItemId, reason: &FailureReason) {
        if reason.is_cancelled() {
            tracing::info!(item = %id, "transfer cancelled");
        } else {
            tracing::warn!(item = %id, reason = %reason, "transfer failed");
        }
    }
}
