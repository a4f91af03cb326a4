//! Pulls restrictions from the policy authority and applies them.

use std::sync::Arc;

use tracing::debug;
use trustagent_core::{
    AgentId, CeilingChange, ConfigTokenSource, ConfigureRequest, PolicyOutcome, PolicySnapshot,
    TrustState, UserId, reconcile,
};

use crate::connection::ConnectionSupervisor;
use crate::event::{SessionEvent, TimerKind};
use crate::platform::DevicePolicy;
use crate::queue::EventQueue;
use crate::scheduler::ExpiryScheduler;

pub struct PolicySync {
    policy: Arc<dyn DevicePolicy>,
    tokens: ConfigTokenSource,
}

impl PolicySync {
    pub fn new(policy: Arc<dyn DevicePolicy>) -> Self {
        Self {
            policy,
            tokens: ConfigTokenSource::new(),
        }
    }

    /// Current restrictions for `agent_id`. The configuration payload is
    /// only fetched while trust agents are disabled.
    pub fn read(&self, agent_id: &AgentId, user_id: UserId) -> PolicySnapshot {
        let trust_agents_disabled = self.policy.trust_agents_disabled(user_id);
        let configuration = if trust_agents_disabled {
            self.policy.trust_agent_configuration(agent_id, user_id)
        } else {
            Vec::new()
        };
        PolicySnapshot {
            trust_agents_disabled,
            configuration,
            max_time_to_lock_ms: self.policy.maximum_time_to_lock_ms(user_id),
        }
    }

    /// Read, reconcile into `state`, and carry out the agent-facing and
    /// timer effects. Verdict notification is left to the caller.
    pub fn sync(
        &mut self,
        state: &mut TrustState,
        connection: &ConnectionSupervisor,
        timers: &mut ExpiryScheduler,
        queue: &EventQueue,
    ) -> PolicyOutcome {
        let snapshot = self.read(connection.agent_id(), connection.user_id());
        debug!(
            agent = %connection.agent_id(),
            disabled = snapshot.trust_agents_disabled,
            configs = snapshot.configuration.len(),
            max_time_to_lock_ms = snapshot.max_time_to_lock_ms,
            "policy snapshot"
        );
        let outcome = reconcile(
            state,
            snapshot,
            connection.is_connected(),
            &mut self.tokens,
        );

        match &outcome.configure {
            Some(ConfigureRequest::AwaitAck {
                configuration,
                token,
            }) => {
                debug!(
                    agent = %connection.agent_id(),
                    %token,
                    "agent disabled until it acknowledges configuration"
                );
                let configuration = configuration.clone();
                let token = *token;
                connection.call("on_configure", |agent| {
                    agent.on_configure(configuration, Some(token))
                });
            }
            Some(ConfigureRequest::Empty) => {
                connection.call("on_configure", |agent| agent.on_configure(Vec::new(), None));
            }
            None => {}
        }

        if let CeilingChange::Changed {
            expiry_was_armed: true,
        } = outcome.ceiling
        {
            // Have the agent re-evaluate trust under the new ceiling.
            timers.cancel(TimerKind::Expiry);
            queue.push(SessionEvent::TrustTimeout);
        }

        outcome
    }
}
