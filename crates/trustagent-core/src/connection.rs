//! Connection lifecycle and restart window for one agent binding.
//!
//! Pure, testable state machine with no IO or async dependencies.
//! All time values are passed in as milliseconds on the caller's
//! monotonic clock.

use serde::{Deserialize, Serialize};

// ─── Restart Policy ──────────────────────────────────────────────

/// Default window the agent gets to (re)connect before the session is
/// recreated (5 minutes).
pub const DEFAULT_RESTART_TIMEOUT_MS: u64 = 5 * 60_000;

/// Configuration for the restart window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// How long a connection attempt may take before escalation
    /// (default 300000 = 5min).
    pub restart_timeout_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_timeout_ms: DEFAULT_RESTART_TIMEOUT_MS,
        }
    }
}

// ─── Connection State Machine ────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Unbound,
    /// Bind requested, agent not yet connected.
    Binding,
    Connected,
    /// Was connected, lost the agent.
    Disconnected,
}

/// What the caller must do with the restart timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Arm (or re-arm) the restart timer for `at_ms`.
    Schedule { at_ms: u64 },
    /// Cancel the restart timer.
    Cancel,
    /// Leave timers alone.
    Keep,
}

/// Tracks the binding of one session to its agent.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    policy: RestartPolicy,
    state: ConnectionState,
    bound: bool,
    scheduled_restart_ms: Option<u64>,
}

impl ConnectionTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Unbound,
            bound: false,
            scheduled_restart_ms: None,
        }
    }

    fn schedule(&mut self, now_ms: u64) -> RestartDecision {
        let at_ms = now_ms.saturating_add(self.policy.restart_timeout_ms);
        self.scheduled_restart_ms = Some(at_ms);
        RestartDecision::Schedule { at_ms }
    }

    /// A bind is about to be requested at `now_ms`.
    ///
    /// The restart window opens before the bind call so that a bind which
    /// never reports back still escalates.
    pub fn begin_bind(&mut self, now_ms: u64) -> RestartDecision {
        self.state = ConnectionState::Binding;
        self.schedule(now_ms)
    }

    /// Outcome of the bind request itself.
    pub fn bind_requested(&mut self, accepted: bool) -> RestartDecision {
        if accepted {
            self.bound = true;
            RestartDecision::Keep
        } else {
            self.bound = false;
            self.state = ConnectionState::Unbound;
            self.scheduled_restart_ms = None;
            RestartDecision::Cancel
        }
    }

    pub fn connected(&mut self) -> RestartDecision {
        self.state = ConnectionState::Connected;
        self.scheduled_restart_ms = None;
        RestartDecision::Cancel
    }

    /// Lost the agent at `now_ms`. A restart is only scheduled while the
    /// session still intends to stay bound.
    pub fn disconnected(&mut self, now_ms: u64) -> RestartDecision {
        self.state = ConnectionState::Disconnected;
        if self.bound {
            self.schedule(now_ms)
        } else {
            RestartDecision::Keep
        }
    }

    /// Release the binding. Returns `true` only on the first effective
    /// teardown; later calls are no-ops.
    pub fn teardown(&mut self) -> bool {
        self.scheduled_restart_ms = None;
        if !self.bound {
            return false;
        }
        self.bound = false;
        self.state = ConnectionState::Unbound;
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// When not connected, the time the session will be recreated.
    pub fn scheduled_restart_ms(&self) -> Option<u64> {
        self.scheduled_restart_ms
    }
}

// ─── Tests ───────────────────────────────────────────────────────
