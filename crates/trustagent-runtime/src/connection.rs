//! Ownership of the binding and the live agent handle.
//!
//! The handle never leaves this type: other components either ask for
//! state or run a scoped call through [`ConnectionSupervisor::call`].

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use trustagent_core::{
    AgentError, AgentId, BindError, ConnectionState, ConnectionTracker, RestartDecision,
    RestartPolicy, UserId,
};

use crate::clock::SessionClock;
use crate::event::{AgentHandle, TimerKind};
use crate::platform::{AgentBinder, AgentLink, TrustAgentService};
use crate::scheduler::ExpiryScheduler;

pub struct ConnectionSupervisor {
    agent_id: AgentId,
    user_id: UserId,
    binder: Arc<dyn AgentBinder>,
    tracker: ConnectionTracker,
    agent: Option<AgentHandle>,
}

impl ConnectionSupervisor {
    pub fn new(
        agent_id: AgentId,
        user_id: UserId,
        binder: Arc<dyn AgentBinder>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            agent_id,
            user_id,
            binder,
            tracker: ConnectionTracker::new(policy),
            agent: None,
        }
    }

    /// Request the binding. The restart window is armed first so a bind
    /// that never reports back still escalates.
    pub fn connect(
        &mut self,
        link: AgentLink,
        timers: &mut ExpiryScheduler,
        clock: &SessionClock,
    ) -> Result<(), BindError> {
        let decision = self.tracker.begin_bind(clock.now_ms());
        apply_restart(decision, timers, clock);

        match self.binder.bind(&self.agent_id, self.user_id, link) {
            Ok(()) => {
                self.tracker.bind_requested(true);
                debug!(agent = %self.agent_id, user = self.user_id, "bind requested");
                Ok(())
            }
            Err(e) => {
                let decision = self.tracker.bind_requested(false);
                apply_restart(decision, timers, clock);
                error!(
                    agent = %self.agent_id,
                    user = self.user_id,
                    "can't bind to trust agent: {e}"
                );
                Err(e)
            }
        }
    }

    pub fn on_connected(
        &mut self,
        agent: AgentHandle,
        timers: &mut ExpiryScheduler,
        clock: &SessionClock,
    ) {
        let decision = self.tracker.connected();
        apply_restart(decision, timers, clock);
        self.agent = Some(agent);
        info!(agent = %self.agent_id, user = self.user_id, "trust agent connected");
    }

    pub fn on_disconnected(&mut self, timers: &mut ExpiryScheduler, clock: &SessionClock) {
        self.agent = None;
        let decision = self.tracker.disconnected(clock.now_ms());
        apply_restart(decision, timers, clock);
        info!(
            agent = %self.agent_id,
            user = self.user_id,
            restart_scheduled = timers.is_armed(TimerKind::Restart),
            "trust agent disconnected"
        );
    }

    /// Release the binding. Returns `true` only the first time; later calls
    /// only make sure no restart alarm is left.
    pub fn teardown(&mut self, timers: &mut ExpiryScheduler) -> bool {
        timers.cancel(TimerKind::Restart);
        if !self.tracker.teardown() {
            return false;
        }
        self.binder.unbind(&self.agent_id, self.user_id);
        self.agent = None;
        debug!(agent = %self.agent_id, user = self.user_id, "trust agent unbound");
        true
    }

    /// Run `f` against the live agent. Failures are logged and swallowed;
    /// returns whether the call was delivered.
    pub fn call<F>(&self, op: &'static str, f: F) -> bool
    where
        F: FnOnce(&dyn TrustAgentService) -> Result<(), AgentError>,
    {
        let Some(agent) = &self.agent else {
            debug!(agent = %self.agent_id, op, "agent not connected, skipping call");
            return false;
        };
        match f(agent.0.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %self.agent_id, user = self.user_id, op, "agent call failed: {e}");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.agent.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.tracker.is_bound()
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn scheduled_restart_ms(&self) -> Option<u64> {
        self.tracker.scheduled_restart_ms()
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

fn apply_restart(decision: RestartDecision, timers: &mut ExpiryScheduler, clock: &SessionClock) {
    match decision {
        RestartDecision::Schedule { at_ms } => {
            timers.arm(TimerKind::Restart, clock.instant_at(at_ms));
        }
        RestartDecision::Cancel => {
            timers.cancel(TimerKind::Restart);
        }
        RestartDecision::Keep => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::recording::{LoopbackBinder, RecordingAgent};

    fn supervisor(binder: Arc<LoopbackBinder>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            AgentId::new("test/.Agent"),
            10,
            binder,
            RestartPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_arms_restart_until_connected() {
        let queue = EventQueue::new();
        let mut timers = ExpiryScheduler::new(queue.sender());
        let clock = SessionClock::start();
        let binder = Arc::new(LoopbackBinder::new());
        let mut sup = supervisor(binder.clone());

        sup.connect(AgentLink::new(queue.sender()), &mut timers, &clock)
            .unwrap();
        assert!(sup.is_bound());
        assert_eq!(sup.state(), ConnectionState::Binding);
        assert!(timers.is_armed(TimerKind::Restart));
        assert_eq!(sup.scheduled_restart_ms(), Some(300_000));

        let agent = Arc::new(RecordingAgent::new());
        sup.on_connected(AgentHandle(agent), &mut timers, &clock);
        assert!(sup.is_connected());
        assert!(!timers.is_armed(TimerKind::Restart));
        assert_eq!(sup.scheduled_restart_ms(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn bind_failure_leaves_session_unbound() {
        let queue = EventQueue::new();
        let mut timers = ExpiryScheduler::new(queue.sender());
        let clock = SessionClock::start();
        let binder = Arc::new(LoopbackBinder::new());
        binder.fail_binds("no such service");
        let mut sup = supervisor(binder);

        let err = sup
            .connect(AgentLink::new(queue.sender()), &mut timers, &clock)
            .unwrap_err();
        assert!(err.to_string().contains("no such service"));
        assert!(!sup.is_bound());
        assert!(!timers.is_armed(TimerKind::Restart));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_unbinds_once() {
        let queue = EventQueue::new();
        let mut timers = ExpiryScheduler::new(queue.sender());
        let clock = SessionClock::start();
        let binder = Arc::new(LoopbackBinder::new());
        let mut sup = supervisor(binder.clone());
        sup.connect(AgentLink::new(queue.sender()), &mut timers, &clock)
            .unwrap();

        assert!(sup.teardown(&mut timers));
        assert!(!sup.teardown(&mut timers));
        assert_eq!(binder.unbind_count(), 1);
        assert!(!timers.is_armed(TimerKind::Restart));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_is_swallowed() {
        let queue = EventQueue::new();
        let mut timers = ExpiryScheduler::new(queue.sender());
        let clock = SessionClock::start();
        let mut sup = supervisor(Arc::new(LoopbackBinder::new()));
        assert!(!sup.call("on_device_locked", |a| a.on_device_locked()));

        let agent = Arc::new(RecordingAgent::new());
        agent.set_failing(true);
        sup.on_connected(AgentHandle(agent.clone()), &mut timers, &clock);
        assert!(!sup.call("on_device_locked", |a| a.on_device_locked()));

        agent.set_failing(false);
        assert!(sup.call("on_device_locked", |a| a.on_device_locked()));
    }
}
