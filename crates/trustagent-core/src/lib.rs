//! trustagent-core: pure state machines for supervising one trust agent.
//! Trust verdict, connection/restart window, and policy reconciliation.
//! No IO, no async; the runtime crate drives these from its event queue.

pub mod connection;
pub mod error;
pub mod policy;
pub mod trust;
pub mod types;

pub use connection::{ConnectionState, ConnectionTracker, RestartDecision, RestartPolicy};
pub use error::{AgentError, BindError};
pub use policy::{ConfigureRequest, PolicyOutcome, PolicySnapshot, reconcile};
pub use trust::{
    AckOutcome, CeilingChange, GrantOutcome, Transition, TrustGrant, TrustPhase, TrustState,
    effective_duration_ms,
};
pub use types::{
    AgentConfiguration, AgentId, ConfigToken, ConfigTokenSource, EscrowGate, EscrowHandle,
    GatePolarity, TokenState, TrustFlags, UserId, Verdict,
};
