use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Identity ─────────────────────────────────────────────────────

/// User context the session runs for.
pub type UserId = i32;

/// Opaque identifier of the remote agent service (e.g. a component name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Trust Flags ──────────────────────────────────────────────────

/// Flags attached to a grant and forwarded verbatim to the manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustFlags(u32);

impl TrustFlags {
    pub const NONE: Self = Self(0);
    /// The user initiated the action that led to the grant.
    pub const INITIATED_BY_USER: Self = Self(1);
    /// The manager may dismiss the keyguard as a result of the grant.
    pub const DISMISS_KEYGUARD: Self = Self(1 << 1);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TrustFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ─── Verdict ──────────────────────────────────────────────────────

/// Externally visible pair derived from the trust fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verdict {
    pub trusted: bool,
    pub managing_trust: bool,
}

// ─── Policy Handshake ─────────────────────────────────────────────

/// Correlation id for one outstanding configuration acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigToken(u64);

impl ConfigToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConfigToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfg-{}", self.0)
    }
}

/// Monotonic source of fresh [`ConfigToken`]s; tokens are never reused
/// within one session.
#[derive(Debug, Default, Clone)]
pub struct ConfigTokenSource {
    next: u64,
}

impl ConfigTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&mut self) -> ConfigToken {
        self.next = self.next.wrapping_add(1);
        ConfigToken(self.next)
    }
}

/// One administrator-supplied configuration bundle for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentConfiguration(pub serde_json::Map<String, serde_json::Value>);

// ─── Escrow ───────────────────────────────────────────────────────

/// Handle issued by the token authority for an escrow token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowHandle(pub i64);

impl fmt::Display for EscrowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Inactive,
}

impl TokenState {
    pub fn from_active(active: bool) -> Self {
        if active { Self::Active } else { Self::Inactive }
    }
}

/// Which reading of the escrow capability flag rejects requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolarity {
    /// Reject while the capability flag is false.
    #[default]
    RejectWhenDisallowed,
    /// Reject while the capability flag is true. Some platform builds gate
    /// this way; kept selectable until the intended polarity is settled.
    RejectWhenAllowed,
}

/// Environment-supplied escrow capability check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowGate {
    pub allow_escrow_token: bool,
    pub polarity: GatePolarity,
}

impl EscrowGate {
    pub fn allowing() -> Self {
        Self {
            allow_escrow_token: true,
            polarity: GatePolarity::RejectWhenDisallowed,
        }
    }

    /// Whether an escrow request passes the gate.
    pub fn admits(&self) -> bool {
        match self.polarity {
            GatePolarity::RejectWhenDisallowed => self.allow_escrow_token,
            GatePolarity::RejectWhenAllowed => !self.allow_escrow_token,
        }
    }
}
