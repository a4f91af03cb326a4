//! Error types for the trust agent boundary.

use thiserror::Error;

use crate::types::{AgentId, UserId};

/// Failure while calling into the remote agent.
///
/// Always best-effort: callers log and continue, the local state already
/// reflects the intended transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent call {op} failed: {detail}")]
    Remote { op: &'static str, detail: String },
}

impl AgentError {
    pub fn remote(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Remote {
            op,
            detail: detail.into(),
        }
    }
}

/// The platform refused to even start binding to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot bind to trust agent {agent_id} for user {user_id}: {reason}")]
pub struct BindError {
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub reason: String,
}
