use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use trustagent_core::{ConfigToken, EscrowHandle, TrustGrant, UserId};

use crate::platform::TrustAgentService;

/// Live connection to the agent, as carried on the queue.
#[derive(Clone)]
pub struct AgentHandle(pub(crate) Arc<dyn TrustAgentService>);

impl From<Arc<dyn TrustAgentService>> for AgentHandle {
    fn from(service: Arc<dyn TrustAgentService>) -> Self {
        Self(service)
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentHandle(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Expiry,
    Restart,
}

/// Escrow request from the agent, already past the capability gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowRequest {
    Add {
        token: Vec<u8>,
        user_id: UserId,
    },
    QueryState {
        handle: EscrowHandle,
        user_id: UserId,
    },
    Remove {
        handle: EscrowHandle,
        user_id: UserId,
    },
    Unlock {
        handle: EscrowHandle,
        token: Vec<u8>,
        user_id: UserId,
    },
}

/// Everything the session worker reacts to, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    // Agent callbacks
    GrantTrust(TrustGrant),
    RevokeTrust,
    SetManagingTrust(bool),
    ConfigureCompleted { token: ConfigToken, success: bool },
    Escrow(EscrowRequest),

    // Connection lifecycle
    Connected(AgentHandle),
    Disconnected,

    // Timers. `generation` identifies the arming the event belongs to.
    TimerFired { kind: TimerKind, generation: u64 },
    /// Forced timeout after the policy ceiling moved.
    TrustTimeout,

    // Owning manager
    UnlockAttempt(bool),
    UnlockLockout { timeout_ms: u64 },
    DeviceLocked,
    DeviceUnlocked,
    RefreshPolicy { reply: Option<oneshot::Sender<bool>> },
    Destroy,

    /// Revoke forced by teardown.
    ForcedRevoke,
    /// Process everything queued, then reply.
    Flush { reply: oneshot::Sender<()> },
}
