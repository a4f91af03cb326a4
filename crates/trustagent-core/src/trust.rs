//! Trust verdict state machine.
//!
//! Pure and side-effect free: every mutation returns what changed and the
//! caller (the session worker) performs the effects (timers, audit log,
//! manager notification, agent calls).

use serde::{Deserialize, Serialize};

use crate::types::{ConfigToken, TrustFlags, Verdict};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Coarse phase of the trust machine, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPhase {
    Disconnected,
    ConnectedUntrusted,
    ConnectedTrusted,
    ConnectedTrustedExpiring,
}

/// A grant request as received from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustGrant {
    pub message: Option<String>,
    /// Requested duration; 0 means until revoked.
    pub duration_ms: u64,
    pub flags: TrustFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Agent not connected; nothing changed.
    Ignored,
    Granted {
        /// Clamped duration to arm an expiry for, if the grant carried one.
        expiry_ms: Option<u64>,
        transition: Transition,
    },
}

/// Verdict before and after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub before: Verdict,
    pub after: Verdict,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Token does not match the outstanding handshake; dropped.
    Stale,
    /// Handshake consumed. `transition` reflects a possible re-enable.
    Consumed { transition: Transition },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingChange {
    Unchanged,
    /// Ceiling moved. When an expiry was armed it is now considered
    /// cancelled and the caller must force a trust timeout.
    Changed { expiry_was_armed: bool },
}

// ---------------------------------------------------------------------------
// Effective duration
// ---------------------------------------------------------------------------

/// Clamp a requested trust duration to the policy ceiling (0 = unlimited).
#[must_use]
pub fn effective_duration_ms(requested_ms: u64, ceiling_ms: u64) -> u64 {
    if ceiling_ms == 0 {
        requested_ms
    } else {
        requested_ms.min(ceiling_ms)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Trust fields of one session.
///
/// Raw fields are kept separately; the visible verdict is always derived:
/// `trusted && managing_trust && !policy_disabled`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrustState {
    trusted: bool,
    managing_trust: bool,
    policy_disabled: bool,
    message: Option<String>,
    expiry_armed: bool,
    pending_config: Option<ConfigToken>,
    max_trust_duration_ms: u64,
}

impl TrustState {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        Verdict {
            trusted: self.is_trusted(),
            managing_trust: self.is_managing_trust(),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted && self.managing_trust && !self.policy_disabled
    }

    pub fn is_managing_trust(&self) -> bool {
        self.managing_trust && !self.policy_disabled
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn policy_disabled(&self) -> bool {
        self.policy_disabled
    }

    pub fn pending_config(&self) -> Option<ConfigToken> {
        self.pending_config
    }

    pub fn max_trust_duration_ms(&self) -> u64 {
        self.max_trust_duration_ms
    }

    pub fn expiry_armed(&self) -> bool {
        self.expiry_armed
    }

    #[must_use]
    pub fn phase(&self, connected: bool) -> TrustPhase {
        if !connected {
            TrustPhase::Disconnected
        } else if !self.trusted {
            TrustPhase::ConnectedUntrusted
        } else if self.expiry_armed {
            TrustPhase::ConnectedTrustedExpiring
        } else {
            TrustPhase::ConnectedTrusted
        }
    }

    fn mutate(&mut self, f: impl FnOnce(&mut Self)) -> Transition {
        let before = self.verdict();
        f(self);
        Transition {
            before,
            after: self.verdict(),
        }
    }

    /// Apply a grant. Ignored unless the agent is connected.
    pub fn grant(&mut self, grant: &TrustGrant, connected: bool) -> GrantOutcome {
        if !connected {
            return GrantOutcome::Ignored;
        }
        let ceiling = self.max_trust_duration_ms;
        let mut expiry_ms = None;
        let transition = self.mutate(|s| {
            s.trusted = true;
            s.message = grant.message.clone();
            if grant.duration_ms > 0 {
                s.expiry_armed = true;
                expiry_ms = Some(effective_duration_ms(grant.duration_ms, ceiling));
            }
        });
        GrantOutcome::Granted {
            expiry_ms,
            transition,
        }
    }

    /// Drop trust and any armed expiry. Idempotent.
    pub fn revoke(&mut self) -> Transition {
        self.mutate(|s| {
            s.trusted = false;
            s.message = None;
            s.expiry_armed = false;
        })
    }

    /// Clearing the managing flag implies a revoke.
    pub fn set_managing_trust(&mut self, managing: bool) -> Transition {
        self.mutate(|s| {
            s.managing_trust = managing;
            if !managing {
                s.trusted = false;
                s.message = None;
                s.expiry_armed = false;
            }
        })
    }

    /// The agent went away: nothing it declared survives, and any
    /// outstanding configuration handshake becomes stale.
    pub fn disconnected(&mut self) -> Transition {
        self.mutate(|s| {
            s.trusted = false;
            s.managing_trust = false;
            s.message = None;
            s.expiry_armed = false;
            s.pending_config = None;
        })
    }

    pub fn set_policy_disabled(&mut self, disabled: bool) -> Transition {
        self.mutate(|s| s.policy_disabled = disabled)
    }

    /// Start a configuration handshake, replacing any outstanding one.
    pub fn begin_config_handshake(&mut self, token: ConfigToken) {
        self.pending_config = Some(token);
    }

    pub fn clear_config_handshake(&mut self) {
        self.pending_config = None;
    }

    /// Apply an acknowledgement. Only the outstanding token is honoured.
    pub fn ack_config(&mut self, token: ConfigToken, success: bool) -> AckOutcome {
        if self.pending_config != Some(token) {
            return AckOutcome::Stale;
        }
        let transition = self.mutate(|s| {
            s.pending_config = None;
            if s.policy_disabled && success {
                s.policy_disabled = false;
            }
        });
        AckOutcome::Consumed { transition }
    }

    /// Record the policy ceiling for future grants.
    pub fn set_max_trust_duration(&mut self, ceiling_ms: u64) -> CeilingChange {
        if ceiling_ms == self.max_trust_duration_ms {
            return CeilingChange::Unchanged;
        }
        self.max_trust_duration_ms = ceiling_ms;
        let expiry_was_armed = self.expiry_armed;
        self.expiry_armed = false;
        CeilingChange::Changed { expiry_was_armed }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
