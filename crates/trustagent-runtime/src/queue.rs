//! Single-consumer FIFO feeding the session worker.
//!
//! Producers on any thread only enqueue. Sending never blocks, so agent
//! callbacks and timers cannot stall on a busy session.

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::SessionEvent;

/// Cloneable producer side of the queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Append `event` to the tail. Events sent after the worker stopped are
    /// dropped.
    pub fn send(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "session worker gone, dropping event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the session worker. It holds a producer of its
/// own for derived events, so [`recv`](EventQueue::recv) never reports the
/// queue closed; the worker stops on cancellation instead.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    tx: EventSender,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            tx: EventSender { tx },
        }
    }

    /// A producer handle for this queue.
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Enqueue a derived event from inside a handler. It runs after every
    /// event already queued.
    pub fn push(&self, event: SessionEvent) {
        self.tx.send(event);
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
