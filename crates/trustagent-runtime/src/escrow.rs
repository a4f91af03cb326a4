//! Escrow token requests between the agent and the token authority.
//!
//! Requests are gated before they are queued; admitted ones are served one
//! at a time by the session worker, in queue order.

use tracing::{debug, error};
use trustagent_core::{EscrowGate, TokenState};

use crate::connection::ConnectionSupervisor;
use crate::event::{EscrowRequest, SessionEvent};
use crate::platform::TrustManager;
use crate::queue::EventSender;

#[derive(Debug, Clone, Copy)]
pub struct EscrowTokenBridge {
    gate: EscrowGate,
}

impl EscrowTokenBridge {
    pub fn new(gate: EscrowGate) -> Self {
        Self { gate }
    }

    /// Gate and enqueue. A rejected request leaves no trace but the log.
    pub fn submit(&self, events: &EventSender, request: EscrowRequest) {
        if !self.gate.admits() {
            error!(request = request.kind(), "escrow token API is not allowed");
            return;
        }
        debug!(request = request.kind(), user = request.user_id(), "escrow request queued");
        events.send(SessionEvent::Escrow(request));
    }

    /// Serve one admitted request against the authority and answer the
    /// agent. Unlock requests get no reply.
    pub fn handle(
        &self,
        request: EscrowRequest,
        manager: &dyn TrustManager,
        connection: &ConnectionSupervisor,
    ) {
        match request {
            EscrowRequest::Add { token, user_id } => {
                let handle = manager.add_escrow_token(&token, user_id);
                connection.call("on_escrow_token_added", |agent| {
                    agent.on_escrow_token_added(&token, handle, user_id)
                });
            }
            EscrowRequest::QueryState { handle, user_id } => {
                let state =
                    TokenState::from_active(manager.is_escrow_token_active(handle, user_id));
                connection.call("on_token_state_received", |agent| {
                    agent.on_token_state_received(handle, state)
                });
            }
            EscrowRequest::Remove { handle, user_id } => {
                let success = manager.remove_escrow_token(handle, user_id);
                connection.call("on_escrow_token_removed", |agent| {
                    agent.on_escrow_token_removed(handle, success)
                });
            }
            EscrowRequest::Unlock {
                handle,
                token,
                user_id,
            } => {
                manager.unlock_user_with_token(handle, &token, user_id);
            }
        }
    }
}

impl EscrowRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::QueryState { .. } => "query_state",
            Self::Remove { .. } => "remove",
            Self::Unlock { .. } => "unlock",
        }
    }

    pub fn user_id(&self) -> trustagent_core::UserId {
        match self {
            Self::Add { user_id, .. }
            | Self::QueryState { user_id, .. }
            | Self::Remove { user_id, .. }
            | Self::Unlock { user_id, .. } => *user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use trustagent_core::{EscrowHandle, GatePolarity};

    fn drain(queue: &mut EventQueue) -> usize {
        let mut n = 0;
        while queue.try_recv().is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn disallowed_requests_are_never_queued() {
        let mut queue = EventQueue::new();
        let bridge = EscrowTokenBridge::new(EscrowGate::default());
        bridge.submit(
            &queue.sender(),
            EscrowRequest::Add {
                token: vec![1, 2, 3],
                user_id: 0,
            },
        );
        bridge.submit(
            &queue.sender(),
            EscrowRequest::Remove {
                handle: EscrowHandle(4),
                user_id: 0,
            },
        );
        assert_eq!(drain(&mut queue), 0);
    }

    #[test]
    fn admitted_requests_keep_their_order() {
        let mut queue = EventQueue::new();
        let bridge = EscrowTokenBridge::new(EscrowGate::allowing());
        let sender = queue.sender();
        bridge.submit(
            &sender,
            EscrowRequest::Remove {
                handle: EscrowHandle(9),
                user_id: 0,
            },
        );
        bridge.submit(
            &sender,
            EscrowRequest::QueryState {
                handle: EscrowHandle(9),
                user_id: 0,
            },
        );
        let kinds: Vec<_> = std::iter::from_fn(|| queue.try_recv())
            .filter_map(|e| match e {
                SessionEvent::Escrow(r) => Some(r.kind()),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["remove", "query_state"]);
    }

    #[test]
    fn inverted_polarity_rejects_when_flag_set() {
        let mut queue = EventQueue::new();
        let bridge = EscrowTokenBridge::new(EscrowGate {
            allow_escrow_token: true,
            polarity: GatePolarity::RejectWhenAllowed,
        });
        bridge.submit(
            &queue.sender(),
            EscrowRequest::QueryState {
                handle: EscrowHandle(1),
                user_id: 0,
            },
        );
        assert_eq!(drain(&mut queue), 0);
    }
}
