use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use maxlock_common::{NodeError, NodeId, time};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::scripts::ScriptKind;

pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// A node-level failure observed while running a lock operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockEvent {
    pub node: NodeId,
    pub operation: ScriptKind,
    pub error: NodeError,
    pub at: DateTime<Utc>,
}

impl LockEvent {
    pub fn new(node: NodeId, operation: ScriptKind, error: NodeError) -> Self {
        Self {
            node,
            operation,
            error,
            at: time::now(),
        }
    }
}

/// Receives node failures. Publishing never blocks and never fails the
/// operation that produced the event.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LockEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: LockEvent) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: LockEvent) {
        if event.error.is_resource_locked() {
            debug!(
                node = %event.node,
                operation = %event.operation,
                error = %event.error,
                "node voted against"
            );
            return;
        }
        warn!(
            node = %event.node,
            operation = %event.operation,
            error = %event.error,
            "node failure"
        );
    }
}

/// Bounded channel sink. Events that do not fit, or that arrive after the
/// stream was dropped, are counted and discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<LockEvent>,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<LockEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, EventStream) {
        let bounded_capacity = if capacity == 0 {
            DEFAULT_EVENT_CAPACITY
        } else {
            capacity
        };
        let (sender, receiver) = mpsc::channel(bounded_capacity);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventStream { receiver },
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: LockEvent) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<LockEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LockEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains everything currently buffered.
    pub fn drain(&mut self) -> Vec<LockEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopSink)
}
