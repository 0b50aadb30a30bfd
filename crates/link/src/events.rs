//! Link lifecycle notifications
//!
//! Internal state transitions are published to an [`EventSink`]. Every
//! notification names the link it concerns and carries no payload.
//!
//! Sinks are invoked while the link's lock is held, from whichever thread
//! caused the transition (a caller or a transfer completion). A sink must not
//! call back into the link and should not block.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a link, used as the event target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl LinkId {
    pub(crate) fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Handshake accepted by the peer
    Connected,
    /// Link fully torn down
    Disconnected,
    /// No more input will arrive
    InputShutdown,
    /// No more output will be sent
    OutputShutdown,
    /// Input buffer went from empty to non-empty
    InputReady,
    /// Output buffer drained onto the wire
    OutputFlushed,
    /// A write was dropped because output is closed
    OutputError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub link: LinkId,
    pub event: LinkEvent,
}

/// Receiver of link notifications
pub trait EventSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Bridge notifications into an async channel, e.g. for a Tokio task
impl EventSink for async_channel::Sender<Notification> {
    fn emit(&self, notification: Notification) {
        if let Err(e) = self.try_send(notification) {
            warn!(
                "Dropping {:?} for {}: {}",
                notification.event, notification.link, e
            );
        }
    }
}

/// Sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _notification: Notification) {}
}

/// Sink that keeps every notification in memory, mainly for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded event kinds in emission order
    pub fn events(&self) -> Vec<LinkEvent> {
        self.lock().iter().map(|n| n.event).collect()
    }

    /// Snapshot of full notifications in emission order
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    /// Number of times `event` was emitted
    pub fn count(&self, event: LinkEvent) -> usize {
        self.lock().iter().filter(|n| n.event == event).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, notification: Notification) {
        self.lock().push(notification);
    }
}
