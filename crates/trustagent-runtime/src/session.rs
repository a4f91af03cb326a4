//! The session worker and the handle the owning manager holds.
//!
//! One worker task per agent. Every input (agent callbacks, connection
//! changes, alarms, manager requests) arrives on the session's event queue
//! and is handled to completion before the next one is taken, so handlers
//! never race each other and may freely mutate the session state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trustagent_core::{
    AckOutcome, AgentId, ConfigToken, ConnectionState, GrantOutcome, Transition,
    TrustFlags, TrustGrant, TrustPhase, TrustState, UserId,
};

use crate::callback::AgentCallback;
use crate::clock::SessionClock;
use crate::config::SessionConfig;
use crate::connection::ConnectionSupervisor;
use crate::error::SessionError;
use crate::escrow::EscrowTokenBridge;
use crate::event::{AgentHandle, SessionEvent, TimerKind};
use crate::platform::{AgentLink, Platform, TrustArchive, TrustManager};
use crate::policy_sync::PolicySync;
use crate::queue::{EventQueue, EventSender};
use crate::scheduler::ExpiryScheduler;

/// Externally visible state, republished after every handled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub bound: bool,
    pub connected: bool,
    pub trusted: bool,
    pub managing_trust: bool,
    pub policy_disabled: bool,
    pub message: Option<String>,
    pub phase: TrustPhase,
    pub expiry_armed: bool,
    /// Session-clock time at which the session will be recreated, while a
    /// restart window is open.
    pub scheduled_restart_ms: Option<u64>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Unbound,
            bound: false,
            connected: false,
            trusted: false,
            managing_trust: false,
            policy_disabled: false,
            message: None,
            phase: TrustPhase::Disconnected,
            expiry_armed: false,
            scheduled_restart_ms: None,
        }
    }
}

/// How a revoke came about; decides what goes to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevokeCause {
    Agent,
    Teardown,
    Timeout,
}

pub struct TrustAgentSession {
    trust: TrustState,
    connection: ConnectionSupervisor,
    timers: ExpiryScheduler,
    policy: PolicySync,
    escrow: EscrowTokenBridge,
    manager: Arc<dyn TrustManager>,
    archive: Arc<dyn TrustArchive>,
    queue: EventQueue,
    clock: SessionClock,
    /// Unlock result reported while no agent was connected.
    pending_unlock: Option<bool>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
}

impl TrustAgentSession {
    /// Build a session, request the binding, and spawn its worker.
    ///
    /// Must be called from within a Tokio runtime. A failed bind is
    /// returned as [`SessionError::Bind`]; the owner decides whether to
    /// retry.
    pub fn start(
        agent_id: AgentId,
        user_id: UserId,
        config: SessionConfig,
        platform: Platform,
    ) -> Result<SessionHandle, SessionError> {
        let (session, snapshot) = Self::new(agent_id, user_id, config, platform)?;
        Ok(session.spawn(snapshot))
    }

    fn new(
        agent_id: AgentId,
        user_id: UserId,
        config: SessionConfig,
        platform: Platform,
    ) -> Result<(Self, watch::Receiver<SessionSnapshot>), SessionError> {
        let queue = EventQueue::new();
        let mut timers = ExpiryScheduler::new(queue.sender());
        let clock = SessionClock::start();
        let mut connection =
            ConnectionSupervisor::new(agent_id, user_id, platform.binder, config.restart);
        connection.connect(AgentLink::new(queue.sender()), &mut timers, &clock)?;

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let session = Self {
            trust: TrustState::new(),
            connection,
            timers,
            policy: PolicySync::new(platform.policy),
            escrow: EscrowTokenBridge::new(config.escrow),
            manager: platform.manager,
            archive: platform.archive,
            queue,
            clock,
            pending_unlock: None,
            snapshot_tx,
            cancel: CancellationToken::new(),
        };
        session.publish();
        Ok((session, snapshot_rx))
    }

    fn spawn(self, snapshot: watch::Receiver<SessionSnapshot>) -> SessionHandle {
        let mut handle = SessionHandle {
            agent_id: self.connection.agent_id().clone(),
            user_id: self.connection.user_id(),
            events: self.queue.sender(),
            snapshot,
            cancel: self.cancel.clone(),
            task: None,
        };
        handle.task = Some(tokio::spawn(self.run()));
        handle
    }

    /// Event loop. Runs until the owner cancels the session.
    async fn run(mut self) {
        info!(
            agent = %self.connection.agent_id(),
            user = self.connection.user_id(),
            "session: event loop started"
        );
        loop {
            tokio::select! {
                biased;
                Some(event) = self.queue.recv() => self.handle_event(event),
                _ = self.cancel.cancelled() => {
                    info!(
                        agent = %self.connection.agent_id(),
                        "session: cancellation requested, shutting down"
                    );
                    // Events queued before cancellation (a destroy, the
                    // revoke it derives) still run.
                    self.drain();
                    break;
                }
            }
        }
    }

    /// Handle queued events, including the ones they derive, until the
    /// queue is empty.
    fn drain(&mut self) {
        while let Some(event) = self.queue.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::GrantTrust(grant) => self.grant_trust(grant),
            SessionEvent::RevokeTrust => self.revoke(RevokeCause::Agent),
            SessionEvent::SetManagingTrust(managing) => self.set_managing_trust(managing),
            SessionEvent::ConfigureCompleted { token, success } => {
                self.configure_completed(token, success)
            }
            SessionEvent::Escrow(request) => {
                self.escrow
                    .handle(request, self.manager.as_ref(), &self.connection)
            }
            SessionEvent::Connected(agent) => self.agent_connected(agent),
            SessionEvent::Disconnected => self.agent_disconnected(),
            SessionEvent::TimerFired { kind, generation } => {
                if !self.timers.accept(kind, generation) {
                    debug!(?kind, generation, "ignoring stale timer");
                    return;
                }
                match kind {
                    TimerKind::Expiry => self.trust_timeout(),
                    TimerKind::Restart => self.restart_timeout(),
                }
            }
            SessionEvent::TrustTimeout => self.trust_timeout(),
            SessionEvent::UnlockAttempt(successful) => self.unlock_attempt(successful),
            SessionEvent::UnlockLockout { timeout_ms } => {
                self.connection.call("on_unlock_lockout", |agent| {
                    agent.on_unlock_lockout(timeout_ms)
                });
            }
            SessionEvent::DeviceLocked => {
                self.connection
                    .call("on_device_locked", |agent| agent.on_device_locked());
            }
            SessionEvent::DeviceUnlocked => {
                self.connection
                    .call("on_device_unlocked", |agent| agent.on_device_unlocked());
            }
            SessionEvent::RefreshPolicy { reply } => {
                let disabled = self.refresh_policy();
                if let Some(reply) = reply {
                    let _ = reply.send(disabled);
                }
            }
            SessionEvent::Destroy => self.teardown(),
            SessionEvent::ForcedRevoke => self.revoke(RevokeCause::Teardown),
            SessionEvent::Flush { reply } => {
                self.drain();
                let _ = reply.send(());
            }
        }
        self.publish();
    }

    // ─── Trust ───────────────────────────────────────────────────────

    fn grant_trust(&mut self, grant: TrustGrant) {
        let outcome = self.trust.grant(&grant, self.connection.is_connected());
        let GrantOutcome::Granted { expiry_ms, .. } = outcome else {
            warn!(
                agent = %self.connection.agent_id(),
                "agent is not connected, cannot grant trust"
            );
            return;
        };

        if let Some(ms) = expiry_ms {
            if ms != grant.duration_ms {
                debug!(
                    requested_ms = grant.duration_ms,
                    effective_ms = ms,
                    "trust duration clamped by policy"
                );
            }
            self.timers.arm(
                TimerKind::Expiry,
                tokio::time::Instant::now() + Duration::from_millis(ms),
            );
        }
        self.archive.log_grant_trust(
            self.connection.user_id(),
            self.connection.agent_id(),
            grant.message.as_deref(),
            grant.duration_ms,
            grant.flags,
        );
        info!(
            agent = %self.connection.agent_id(),
            duration_ms = grant.duration_ms,
            flags = grant.flags.bits(),
            "trust granted"
        );
        // Flags must reach the manager even when the verdict is unchanged.
        self.publish();
        self.manager
            .update_trust(self.connection.user_id(), grant.flags);
    }

    fn revoke(&mut self, cause: RevokeCause) {
        let transition = self.trust.revoke();
        self.timers.cancel(TimerKind::Expiry);
        if cause != RevokeCause::Timeout {
            self.archive
                .log_revoke_trust(self.connection.user_id(), self.connection.agent_id());
        }
        if transition.changed() {
            info!(agent = %self.connection.agent_id(), ?cause, "trust revoked");
        }
        self.notify(transition);
    }

    fn trust_timeout(&mut self) {
        debug!(agent = %self.connection.agent_id(), "trust timed out");
        self.archive
            .log_trust_timeout(self.connection.user_id(), self.connection.agent_id());
        self.connection
            .call("on_trust_timeout", |agent| agent.on_trust_timeout());
        self.revoke(RevokeCause::Timeout);
    }

    fn set_managing_trust(&mut self, managing: bool) {
        let transition = self.trust.set_managing_trust(managing);
        if !managing {
            self.timers.cancel(TimerKind::Expiry);
        }
        self.archive.log_managing_trust(
            self.connection.user_id(),
            self.connection.agent_id(),
            managing,
        );
        self.notify(transition);
    }

    fn configure_completed(&mut self, token: ConfigToken, success: bool) {
        match self.trust.ack_config(token, success) {
            AckOutcome::Stale => {
                debug!(%token, "ignoring configure completion with obsolete token");
            }
            AckOutcome::Consumed { transition } => {
                if transition.changed() {
                    info!(
                        agent = %self.connection.agent_id(),
                        %token,
                        "agent re-enabled after configuration"
                    );
                }
                self.notify(transition);
            }
        }
    }

    // ─── Connection ──────────────────────────────────────────────────

    fn agent_connected(&mut self, agent: AgentHandle) {
        if !self.connection.is_bound() {
            warn!(
                agent = %self.connection.agent_id(),
                "connection reported for unbound session, ignoring"
            );
            return;
        }
        self.connection
            .on_connected(agent, &mut self.timers, &self.clock);
        let user_id = self.connection.user_id();
        self.archive
            .log_agent_connected(user_id, self.connection.agent_id());

        let callback = AgentCallback::new(self.queue.sender(), self.escrow);
        self.connection
            .call("set_callback", |agent| agent.set_callback(callback));
        self.refresh_policy();

        if let Some(successful) = self.pending_unlock.take() {
            self.connection.call("on_unlock_attempt", |agent| {
                agent.on_unlock_attempt(successful)
            });
        }
        if self.manager.is_device_locked_inner(user_id) {
            self.connection
                .call("on_device_locked", |agent| agent.on_device_locked());
        } else {
            self.connection
                .call("on_device_unlocked", |agent| agent.on_device_unlocked());
        }
    }

    fn agent_disconnected(&mut self) {
        if !self.connection.is_bound() && !self.connection.is_connected() {
            debug!(agent = %self.connection.agent_id(), "disconnect after teardown, ignoring");
            return;
        }
        self.connection
            .on_disconnected(&mut self.timers, &self.clock);
        self.timers.cancel(TimerKind::Expiry);
        let transition = self.trust.disconnected();

        let user_id = self.connection.user_id();
        self.archive
            .log_agent_died(user_id, self.connection.agent_id());
        self.archive
            .log_revoke_trust(user_id, self.connection.agent_id());
        self.notify(transition);
    }

    fn restart_timeout(&mut self) {
        warn!(
            agent = %self.connection.agent_id(),
            user = self.connection.user_id(),
            "connection attempt to trust agent timed out, rebinding"
        );
        self.teardown();
        self.manager
            .reset_agent(self.connection.agent_id(), self.connection.user_id());
    }

    fn teardown(&mut self) {
        if !self.connection.teardown(&mut self.timers) {
            debug!(agent = %self.connection.agent_id(), "session already torn down");
            return;
        }
        self.timers.cancel(TimerKind::Expiry);
        self.trust.clear_config_handshake();
        self.archive
            .log_agent_stopped(self.connection.user_id(), self.connection.agent_id());
        self.queue.push(SessionEvent::ForcedRevoke);
        info!(agent = %self.connection.agent_id(), "session torn down");
    }

    // ─── Manager requests ────────────────────────────────────────────

    fn unlock_attempt(&mut self, successful: bool) {
        if self.connection.is_connected() {
            self.connection.call("on_unlock_attempt", |agent| {
                agent.on_unlock_attempt(successful)
            });
        } else {
            debug!(successful, "agent not connected, buffering unlock result");
            self.pending_unlock = Some(successful);
        }
    }

    /// Returns whether trust agents are disabled by policy.
    fn refresh_policy(&mut self) -> bool {
        let outcome = self.policy.sync(
            &mut self.trust,
            &self.connection,
            &mut self.timers,
            &self.queue,
        );
        self.notify(outcome.transition);
        outcome.disabled
    }

    // ─── Publishing ──────────────────────────────────────────────────

    /// Publish, then tell the manager if the verdict moved. Publishing
    /// first lets the manager read the new values from the handle.
    fn notify(&self, transition: Transition) {
        self.publish();
        if transition.changed() {
            self.manager
                .update_trust(self.connection.user_id(), TrustFlags::NONE);
        }
    }

    fn publish(&self) {
        let connected = self.connection.is_connected();
        let snapshot = SessionSnapshot {
            connection: self.connection.state(),
            bound: self.connection.is_bound(),
            connected,
            trusted: self.trust.is_trusted(),
            managing_trust: self.trust.is_managing_trust(),
            policy_disabled: self.trust.policy_disabled(),
            message: self.trust.message().map(str::to_owned),
            phase: self.trust.phase(connected),
            expiry_armed: self.timers.is_armed(TimerKind::Expiry),
            scheduled_restart_ms: self.connection.scheduled_restart_ms(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Owner-side handle to a running session.
///
/// Queries read the latest published snapshot; commands are enqueued.
/// Dropping the handle stops the worker.
#[derive(Debug)]
pub struct SessionHandle {
    agent_id: AgentId,
    user_id: UserId,
    events: EventSender,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_trusted(&self) -> bool {
        self.snapshot.borrow().trusted
    }

    pub fn is_managing_trust(&self) -> bool {
        self.snapshot.borrow().managing_trust
    }

    pub fn message(&self) -> Option<String> {
        self.snapshot.borrow().message.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().connected
    }

    pub fn is_bound(&self) -> bool {
        self.snapshot.borrow().bound
    }

    /// Session-clock millis at which the session will be recreated, if the
    /// agent is not connected and a restart window is open.
    pub fn scheduled_restart_uptime_millis(&self) -> Option<u64> {
        self.snapshot.borrow().scheduled_restart_ms
    }

    /// Tear the session down. The teardown runs even if the handle is
    /// dropped right after this returns.
    pub fn destroy(&self) {
        self.events.send(SessionEvent::Destroy);
    }

    pub fn on_unlock_attempt(&self, successful: bool) {
        self.events.send(SessionEvent::UnlockAttempt(successful));
    }

    pub fn on_unlock_lockout(&self, timeout_ms: u64) {
        self.events.send(SessionEvent::UnlockLockout { timeout_ms });
    }

    pub fn on_device_locked(&self) {
        self.events.send(SessionEvent::DeviceLocked);
    }

    pub fn on_device_unlocked(&self) {
        self.events.send(SessionEvent::DeviceUnlocked);
    }

    /// Broadcast-style policy refresh; nothing to wait for.
    pub fn request_policy_refresh(&self) {
        self.events.send(SessionEvent::RefreshPolicy { reply: None });
    }

    /// Re-read policy and wait for it to be applied. Returns whether trust
    /// agents are disabled.
    pub async fn update_device_policy_features(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::RefreshPolicy { reply: Some(tx) });
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Wait until every event queued so far, and everything they derived,
    /// has been handled.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.events.send(SessionEvent::Flush { reply: tx });
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop the worker and wait for it to exit. Unlike [`destroy`], this
    /// does not release the binding.
    ///
    /// [`destroy`]: SessionHandle::destroy
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(agent = %self.agent_id, "session worker ended abnormally: {e}");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{AgentCall, ArchiveKind, RecordingAgent, RecordingPlatform};
    use trustagent_core::PolicySnapshot;

    fn build(recording: &RecordingPlatform) -> TrustAgentSession {
        let (session, _rx) = TrustAgentSession::new(
            AgentId::new("test/.Agent"),
            7,
            SessionConfig::default(),
            recording.platform(),
        )
        .unwrap();
        session
    }

    /// Handle everything currently queued.
    fn drain(session: &mut TrustAgentSession) {
        while let Some(event) = session.queue.try_recv() {
            session.handle_event(event);
        }
    }

    fn connect(
        session: &mut TrustAgentSession,
        recording: &RecordingPlatform,
    ) -> Arc<RecordingAgent> {
        let agent = Arc::new(RecordingAgent::new());
        assert!(recording.binder.connect(agent.clone()));
        drain(session);
        agent
    }

    fn grant(duration_ms: u64) -> SessionEvent {
        SessionEvent::GrantTrust(TrustGrant {
            message: Some("on body".into()),
            duration_ms,
            flags: TrustFlags::INITIATED_BY_USER,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn connect_pushes_callback_policy_and_lock_state() {
        let recording = RecordingPlatform::new();
        recording.manager.set_device_locked(true);
        let mut session = build(&recording);
        let agent = connect(&mut session, &recording);

        assert_eq!(
            agent.calls(),
            vec![
                AgentCall::SetCallback,
                AgentCall::Configure {
                    configuration: vec![],
                    token: None
                },
                AgentCall::DeviceLocked,
            ]
        );
        assert!(agent.callback().is_some());
        assert!(!session.timers.is_armed(TimerKind::Restart));
        assert_eq!(
            recording.archive.kinds(),
            vec![ArchiveKind::AgentConnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grant_ignored_while_disconnected() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        session.handle_event(SessionEvent::SetManagingTrust(true));
        session.handle_event(grant(0));
        assert!(!session.trust.is_trusted());
        assert!(recording
            .archive
            .kinds()
            .iter()
            .all(|k| !matches!(k, ArchiveKind::GrantTrust { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn grant_notifies_with_flags_even_when_unchanged() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        connect(&mut session, &recording);
        session.handle_event(SessionEvent::SetManagingTrust(true));
        session.handle_event(grant(0));
        session.handle_event(grant(0));

        let updates = recording.manager.trust_updates();
        let flagged = updates
            .iter()
            .filter(|u| u.flags == TrustFlags::INITIATED_BY_USER)
            .count();
        assert_eq!(flagged, 2);
        assert!(session.snapshot_tx.borrow().trusted);
        assert_eq!(
            session.snapshot_tx.borrow().message.as_deref(),
            Some("on body")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_event_is_dropped() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        connect(&mut session, &recording);
        session.handle_event(SessionEvent::SetManagingTrust(true));
        session.handle_event(grant(1_000));
        session.handle_event(grant(5_000));

        // Generation 1 belonged to the replaced alarm.
        session.handle_event(SessionEvent::TimerFired {
            kind: TimerKind::Expiry,
            generation: 1,
        });
        assert!(session.trust.is_trusted());
        assert!(session.timers.is_armed(TimerKind::Expiry));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_twice_unbinds_once() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        connect(&mut session, &recording);
        session.handle_event(SessionEvent::SetManagingTrust(true));
        session.handle_event(grant(0));

        session.handle_event(SessionEvent::Destroy);
        session.handle_event(SessionEvent::Destroy);
        drain(&mut session);

        assert_eq!(recording.binder.unbind_count(), 1);
        assert!(!session.trust.is_trusted());
        let kinds = recording.archive.kinds();
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == ArchiveKind::AgentStopped)
                .count(),
            1
        );
        assert_eq!(kinds.last(), Some(&ArchiveKind::RevokeTrust));
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_result_buffered_until_connect() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        session.handle_event(SessionEvent::UnlockAttempt(false));
        session.handle_event(SessionEvent::UnlockAttempt(true));
        // Not buffered.
        session.handle_event(SessionEvent::DeviceLocked);

        let agent = connect(&mut session, &recording);
        let calls = agent.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, AgentCall::UnlockAttempt { .. }))
                .collect::<Vec<_>>(),
            vec![&AgentCall::UnlockAttempt { successful: true }]
        );
        assert_eq!(calls.last(), Some(&AgentCall::DeviceUnlocked));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reports_disabled() {
        let recording = RecordingPlatform::new();
        let mut session = build(&recording);
        connect(&mut session, &recording);
        recording.policy.set(PolicySnapshot {
            trust_agents_disabled: true,
            ..PolicySnapshot::default()
        });
        let (tx, rx) = oneshot::channel();
        session.handle_event(SessionEvent::RefreshPolicy { reply: Some(tx) });
        assert!(rx.await.unwrap());
        assert!(session.trust.policy_disabled());
    }
}
