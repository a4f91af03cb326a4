//! Callback endpoint handed to the agent.
//!
//! Every method only enqueues; the agent may call from any thread.

use tracing::debug;
use trustagent_core::{ConfigToken, EscrowHandle, TrustFlags, TrustGrant, UserId};

use crate::escrow::EscrowTokenBridge;
use crate::event::{EscrowRequest, SessionEvent};
use crate::queue::EventSender;

#[derive(Debug, Clone)]
pub struct AgentCallback {
    events: EventSender,
    escrow: EscrowTokenBridge,
}

impl AgentCallback {
    pub(crate) fn new(events: EventSender, escrow: EscrowTokenBridge) -> Self {
        Self { events, escrow }
    }

    pub fn grant_trust(&self, message: Option<String>, duration_ms: u64, flags: TrustFlags) {
        debug!(?message, duration_ms, flags = flags.bits(), "grant_trust");
        self.events.send(SessionEvent::GrantTrust(TrustGrant {
            message,
            duration_ms,
            flags,
        }));
    }

    pub fn revoke_trust(&self) {
        debug!("revoke_trust");
        self.events.send(SessionEvent::RevokeTrust);
    }

    pub fn set_managing_trust(&self, managing: bool) {
        debug!(managing, "set_managing_trust");
        self.events.send(SessionEvent::SetManagingTrust(managing));
    }

    pub fn on_configure_completed(&self, success: bool, token: ConfigToken) {
        debug!(success, %token, "on_configure_completed");
        self.events
            .send(SessionEvent::ConfigureCompleted { token, success });
    }

    pub fn add_escrow_token(&self, token: Vec<u8>, user_id: UserId) {
        self.escrow
            .submit(&self.events, EscrowRequest::Add { token, user_id });
    }

    pub fn is_escrow_token_active(&self, handle: EscrowHandle, user_id: UserId) {
        self.escrow
            .submit(&self.events, EscrowRequest::QueryState { handle, user_id });
    }

    pub fn remove_escrow_token(&self, handle: EscrowHandle, user_id: UserId) {
        self.escrow
            .submit(&self.events, EscrowRequest::Remove { handle, user_id });
    }

    pub fn unlock_user_with_token(&self, handle: EscrowHandle, token: Vec<u8>, user_id: UserId) {
        self.escrow.submit(
            &self.events,
            EscrowRequest::Unlock {
                handle,
                token,
                user_id,
            },
        );
    }
}
