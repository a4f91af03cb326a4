//! Interfaces consumed from the platform and the owning trust manager.
//!
//! Every method here is called from the session worker and must not block;
//! implementations forward to IPC or enqueue work of their own.

use std::fmt;
use std::sync::Arc;

use trustagent_core::{
    AgentConfiguration, AgentError, AgentId, BindError, ConfigToken, EscrowHandle, TokenState,
    TrustFlags, UserId,
};

use crate::callback::AgentCallback;
use crate::event::SessionEvent;
use crate::queue::EventSender;

/// The remote agent, as reachable over its live connection.
pub trait TrustAgentService: Send + Sync + 'static {
    fn set_callback(&self, callback: AgentCallback) -> Result<(), AgentError>;
    fn on_configure(
        &self,
        configuration: Vec<AgentConfiguration>,
        token: Option<ConfigToken>,
    ) -> Result<(), AgentError>;
    fn on_trust_timeout(&self) -> Result<(), AgentError>;
    fn on_unlock_attempt(&self, successful: bool) -> Result<(), AgentError>;
    fn on_unlock_lockout(&self, timeout_ms: u64) -> Result<(), AgentError>;
    fn on_device_locked(&self) -> Result<(), AgentError>;
    fn on_device_unlocked(&self) -> Result<(), AgentError>;
    fn on_escrow_token_added(
        &self,
        token: &[u8],
        handle: EscrowHandle,
        user_id: UserId,
    ) -> Result<(), AgentError>;
    fn on_token_state_received(
        &self,
        handle: EscrowHandle,
        state: TokenState,
    ) -> Result<(), AgentError>;
    fn on_escrow_token_removed(&self, handle: EscrowHandle, success: bool)
    -> Result<(), AgentError>;
}

/// Platform service that binds to agents.
///
/// After a successful `bind`, the platform reports connection changes
/// through the supplied [`AgentLink`], from any thread.
pub trait AgentBinder: Send + Sync + 'static {
    fn bind(&self, agent_id: &AgentId, user_id: UserId, link: AgentLink) -> Result<(), BindError>;
    fn unbind(&self, agent_id: &AgentId, user_id: UserId);
}

/// Owning trust manager.
pub trait TrustManager: Send + Sync + 'static {
    /// The session's verdict changed (or a grant carried flags).
    fn update_trust(&self, user_id: UserId, flags: TrustFlags);
    /// Throw the session away and build a fresh one.
    fn reset_agent(&self, agent_id: &AgentId, user_id: UserId);
    fn add_escrow_token(&self, token: &[u8], user_id: UserId) -> EscrowHandle;
    fn is_escrow_token_active(&self, handle: EscrowHandle, user_id: UserId) -> bool;
    fn remove_escrow_token(&self, handle: EscrowHandle, user_id: UserId) -> bool;
    fn unlock_user_with_token(&self, handle: EscrowHandle, token: &[u8], user_id: UserId);
    fn is_device_locked_inner(&self, user_id: UserId) -> bool;
}

/// Audit log sink.
pub trait TrustArchive: Send + Sync + 'static {
    fn log_grant_trust(
        &self,
        user_id: UserId,
        agent_id: &AgentId,
        message: Option<&str>,
        duration_ms: u64,
        flags: TrustFlags,
    );
    fn log_revoke_trust(&self, user_id: UserId, agent_id: &AgentId);
    fn log_trust_timeout(&self, user_id: UserId, agent_id: &AgentId);
    fn log_managing_trust(&self, user_id: UserId, agent_id: &AgentId, managing: bool);
    fn log_agent_connected(&self, user_id: UserId, agent_id: &AgentId);
    fn log_agent_died(&self, user_id: UserId, agent_id: &AgentId);
    fn log_agent_stopped(&self, user_id: UserId, agent_id: &AgentId);
}

/// Policy authority.
pub trait DevicePolicy: Send + Sync + 'static {
    fn trust_agents_disabled(&self, user_id: UserId) -> bool;
    fn trust_agent_configuration(
        &self,
        agent_id: &AgentId,
        user_id: UserId,
    ) -> Vec<AgentConfiguration>;
    fn maximum_time_to_lock_ms(&self, user_id: UserId) -> u64;
}

/// Everything a session consumes, bundled.
#[derive(Clone)]
pub struct Platform {
    pub binder: Arc<dyn AgentBinder>,
    pub manager: Arc<dyn TrustManager>,
    pub archive: Arc<dyn TrustArchive>,
    pub policy: Arc<dyn DevicePolicy>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Connection sink handed to [`AgentBinder::bind`].
#[derive(Debug, Clone)]
pub struct AgentLink {
    events: EventSender,
}

impl AgentLink {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// The agent is up and reachable through `service`.
    pub fn connected(&self, service: Arc<dyn TrustAgentService>) {
        self.events.send(SessionEvent::Connected(service.into()));
    }

    /// The agent's process died or the connection dropped.
    pub fn disconnected(&self) {
        self.events.send(SessionEvent::Disconnected);
    }
}
