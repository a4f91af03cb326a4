//! Expiry and restart alarms.
//!
//! One slot per [`TimerKind`]; arming a slot cancels and replaces whatever
//! it held. A fired alarm only enqueues an event. Because an alarm may fire
//! just before it is cancelled, every event carries the generation it was
//! armed with and the worker checks it with [`ExpiryScheduler::accept`].

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::event::{SessionEvent, TimerKind};
use crate::queue::EventSender;

#[derive(Debug)]
struct Armed {
    generation: u64,
    at: Instant,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TimerSlot {
    generation: u64,
    armed: Option<Armed>,
}

impl TimerSlot {
    fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct ExpiryScheduler {
    events: EventSender,
    expiry: TimerSlot,
    restart: TimerSlot,
}

impl ExpiryScheduler {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            expiry: TimerSlot::default(),
            restart: TimerSlot::default(),
        }
    }

    fn slot(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Expiry => &self.expiry,
            TimerKind::Restart => &self.restart,
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Expiry => &mut self.expiry,
            TimerKind::Restart => &mut self.restart,
        }
    }

    /// Arm `kind` for `at`, replacing any alarm of the same kind.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        let events = self.events.clone();
        let slot = self.slot_mut(kind);
        slot.cancel();
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            events.send(SessionEvent::TimerFired { kind, generation });
        });
        slot.armed = Some(Armed {
            generation,
            at,
            task,
        });
        debug!(?kind, generation, "timer armed");
    }

    /// Returns whether an alarm was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let cancelled = self.slot_mut(kind).cancel();
        if cancelled {
            debug!(?kind, "timer cancelled");
        }
        cancelled
    }

    pub fn cancel_all(&mut self) {
        self.cancel(TimerKind::Expiry);
        self.cancel(TimerKind::Restart);
    }

    /// Consume a fired event. Returns `false` for events from an alarm that
    /// has since been cancelled or replaced.
    pub fn accept(&mut self, kind: TimerKind, generation: u64) -> bool {
        let slot = self.slot_mut(kind);
        match &slot.armed {
            Some(armed) if armed.generation == generation => {
                slot.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slot(kind).armed.is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.slot(kind).armed.as_ref().map(|a| a.at)
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.expiry.cancel();
        self.restart.cancel();
    }
}
