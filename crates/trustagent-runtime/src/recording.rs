//! In-process platform that records every interaction.
//!
//! Used by the replay tool and the tests: the binder loops connection
//! changes straight back into the session, the agent and manager log what
//! they were asked to do, and the policy is whatever was last set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use trustagent_core::{
    AgentConfiguration, AgentError, AgentId, BindError, ConfigToken, EscrowHandle, PolicySnapshot,
    TokenState, TrustFlags, UserId,
};

use crate::callback::AgentCallback;
use crate::platform::{
    AgentBinder, AgentLink, DevicePolicy, Platform, TrustAgentService, TrustArchive, TrustManager,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Agent ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum AgentCall {
    SetCallback,
    Configure {
        configuration: Vec<AgentConfiguration>,
        token: Option<ConfigToken>,
    },
    TrustTimeout,
    UnlockAttempt {
        successful: bool,
    },
    UnlockLockout {
        timeout_ms: u64,
    },
    DeviceLocked,
    DeviceUnlocked,
    EscrowTokenAdded {
        token: Vec<u8>,
        handle: EscrowHandle,
        user_id: UserId,
    },
    TokenStateReceived {
        handle: EscrowHandle,
        active: bool,
    },
    EscrowTokenRemoved {
        handle: EscrowHandle,
        success: bool,
    },
}

/// Agent that records calls and keeps the callback it was given.
#[derive(Debug, Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<AgentCall>>,
    callback: Mutex<Option<AgentCallback>>,
    failing: AtomicBool,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call is recorded and then fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        lock(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<AgentCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    pub fn callback(&self) -> Option<AgentCallback> {
        lock(&self.callback).clone()
    }

    /// Token of the most recent configuration that asked for an ack.
    pub fn last_config_token(&self) -> Option<ConfigToken> {
        lock(&self.calls).iter().rev().find_map(|call| match call {
            AgentCall::Configure { token, .. } => *token,
            _ => None,
        })
    }

    fn record(&self, op: &'static str, call: AgentCall) -> Result<(), AgentError> {
        lock(&self.calls).push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::remote(op, "agent process not responding"));
        }
        Ok(())
    }
}

impl TrustAgentService for RecordingAgent {
    fn set_callback(&self, callback: AgentCallback) -> Result<(), AgentError> {
        self.record("set_callback", AgentCall::SetCallback)?;
        *lock(&self.callback) = Some(callback);
        Ok(())
    }

    fn on_configure(
        &self,
        configuration: Vec<AgentConfiguration>,
        token: Option<ConfigToken>,
    ) -> Result<(), AgentError> {
        self.record(
            "on_configure",
            AgentCall::Configure {
                configuration,
                token,
            },
        )
    }

    fn on_trust_timeout(&self) -> Result<(), AgentError> {
        self.record("on_trust_timeout", AgentCall::TrustTimeout)
    }

    fn on_unlock_attempt(&self, successful: bool) -> Result<(), AgentError> {
        self.record("on_unlock_attempt", AgentCall::UnlockAttempt { successful })
    }

    fn on_unlock_lockout(&self, timeout_ms: u64) -> Result<(), AgentError> {
        self.record("on_unlock_lockout", AgentCall::UnlockLockout { timeout_ms })
    }

    fn on_device_locked(&self) -> Result<(), AgentError> {
        self.record("on_device_locked", AgentCall::DeviceLocked)
    }

    fn on_device_unlocked(&self) -> Result<(), AgentError> {
        self.record("on_device_unlocked", AgentCall::DeviceUnlocked)
    }

    fn on_escrow_token_added(
        &self,
        token: &[u8],
        handle: EscrowHandle,
        user_id: UserId,
    ) -> Result<(), AgentError> {
        self.record(
            "on_escrow_token_added",
            AgentCall::EscrowTokenAdded {
                token: token.to_vec(),
                handle,
                user_id,
            },
        )
    }

    fn on_token_state_received(
        &self,
        handle: EscrowHandle,
        state: TokenState,
    ) -> Result<(), AgentError> {
        self.record(
            "on_token_state_received",
            AgentCall::TokenStateReceived {
                handle,
                active: state == TokenState::Active,
            },
        )
    }

    fn on_escrow_token_removed(
        &self,
        handle: EscrowHandle,
        success: bool,
    ) -> Result<(), AgentError> {
        self.record(
            "on_escrow_token_removed",
            AgentCall::EscrowTokenRemoved { handle, success },
        )
    }
}

// ─── Binder ──────────────────────────────────────────────────────

/// Binder that hands the link back to the test driver instead of a
/// platform IPC layer.
#[derive(Debug, Default)]
pub struct LoopbackBinder {
    link: Mutex<Option<AgentLink>>,
    fail_reason: Mutex<Option<String>>,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
}

impl LoopbackBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `bind` fail with `reason`.
    pub fn fail_binds(&self, reason: &str) {
        *lock(&self.fail_reason) = Some(reason.to_string());
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.link).is_some()
    }

    /// Report `agent` as connected. Returns `false` when nothing is bound.
    pub fn connect(&self, agent: Arc<RecordingAgent>) -> bool {
        match lock(&self.link).as_ref() {
            Some(link) => {
                link.connected(agent);
                true
            }
            None => false,
        }
    }

    /// Report the agent as gone. Returns `false` when nothing is bound.
    pub fn disconnect(&self) -> bool {
        match lock(&self.link).as_ref() {
            Some(link) => {
                link.disconnected();
                true
            }
            None => false,
        }
    }
}

impl AgentBinder for LoopbackBinder {
    fn bind(&self, agent_id: &AgentId, user_id: UserId, link: AgentLink) -> Result<(), BindError> {
        if let Some(reason) = lock(&self.fail_reason).clone() {
            return Err(BindError {
                agent_id: agent_id.clone(),
                user_id,
                reason,
            });
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        *lock(&self.link) = Some(link);
        Ok(())
    }

    fn unbind(&self, _agent_id: &AgentId, _user_id: UserId) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        *lock(&self.link) = None;
    }
}

// ─── Manager ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrustUpdate {
    pub user_id: UserId,
    pub flags: TrustFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum EscrowCall {
    Add { user_id: UserId, handle: EscrowHandle },
    IsActive { handle: EscrowHandle, user_id: UserId },
    Remove { handle: EscrowHandle, user_id: UserId },
    Unlock { handle: EscrowHandle, user_id: UserId },
}

/// Manager that records notifications and keeps escrow tokens in memory.
#[derive(Debug, Default)]
pub struct RecordingManager {
    updates: Mutex<Vec<TrustUpdate>>,
    resets: Mutex<Vec<(AgentId, UserId)>>,
    escrow: Mutex<Vec<EscrowCall>>,
    active_tokens: Mutex<HashSet<i64>>,
    next_handle: AtomicI64,
    device_locked: AtomicBool,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device_locked(&self, locked: bool) {
        self.device_locked.store(locked, Ordering::SeqCst);
    }

    pub fn trust_updates(&self) -> Vec<TrustUpdate> {
        lock(&self.updates).clone()
    }

    pub fn resets(&self) -> Vec<(AgentId, UserId)> {
        lock(&self.resets).clone()
    }

    pub fn escrow_calls(&self) -> Vec<EscrowCall> {
        lock(&self.escrow).clone()
    }
}

impl TrustManager for RecordingManager {
    fn update_trust(&self, user_id: UserId, flags: TrustFlags) {
        lock(&self.updates).push(TrustUpdate { user_id, flags });
    }

    fn reset_agent(&self, agent_id: &AgentId, user_id: UserId) {
        lock(&self.resets).push((agent_id.clone(), user_id));
    }

    fn add_escrow_token(&self, _token: &[u8], user_id: UserId) -> EscrowHandle {
        let handle = EscrowHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.active_tokens).insert(handle.0);
        lock(&self.escrow).push(EscrowCall::Add { user_id, handle });
        handle
    }

    fn is_escrow_token_active(&self, handle: EscrowHandle, user_id: UserId) -> bool {
        lock(&self.escrow).push(EscrowCall::IsActive { handle, user_id });
        lock(&self.active_tokens).contains(&handle.0)
    }

    fn remove_escrow_token(&self, handle: EscrowHandle, user_id: UserId) -> bool {
        lock(&self.escrow).push(EscrowCall::Remove { handle, user_id });
        lock(&self.active_tokens).remove(&handle.0)
    }

    fn unlock_user_with_token(&self, handle: EscrowHandle, _token: &[u8], user_id: UserId) {
        lock(&self.escrow).push(EscrowCall::Unlock { handle, user_id });
    }

    fn is_device_locked_inner(&self, _user_id: UserId) -> bool {
        self.device_locked.load(Ordering::SeqCst)
    }
}

// ─── Archive ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArchiveKind {
    GrantTrust {
        message: Option<String>,
        duration_ms: u64,
        flags: u32,
    },
    RevokeTrust,
    TrustTimeout,
    ManagingTrust {
        managing: bool,
    },
    AgentConnected,
    AgentDied,
    AgentStopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub at: DateTime<Utc>,
    pub user_id: UserId,
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub kind: ArchiveKind,
}

#[derive(Debug, Default)]
pub struct RecordingArchive {
    entries: Mutex<Vec<ArchiveEntry>>,
}

impl RecordingArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ArchiveEntry> {
        lock(&self.entries).clone()
    }

    pub fn kinds(&self) -> Vec<ArchiveKind> {
        lock(&self.entries).iter().map(|e| e.kind.clone()).collect()
    }

    fn push(&self, user_id: UserId, agent_id: &AgentId, kind: ArchiveKind) {
        lock(&self.entries).push(ArchiveEntry {
            at: Utc::now(),
            user_id,
            agent_id: agent_id.clone(),
            kind,
        });
    }
}

impl TrustArchive for RecordingArchive {
    fn log_grant_trust(
        &self,
        user_id: UserId,
        agent_id: &AgentId,
        message: Option<&str>,
        duration_ms: u64,
        flags: TrustFlags,
    ) {
        self.push(
            user_id,
            agent_id,
            ArchiveKind::GrantTrust {
                message: message.map(str::to_owned),
                duration_ms,
                flags: flags.bits(),
            },
        );
    }

    fn log_revoke_trust(&self, user_id: UserId, agent_id: &AgentId) {
        self.push(user_id, agent_id, ArchiveKind::RevokeTrust);
    }

    fn log_trust_timeout(&self, user_id: UserId, agent_id: &AgentId) {
        self.push(user_id, agent_id, ArchiveKind::TrustTimeout);
    }

    fn log_managing_trust(&self, user_id: UserId, agent_id: &AgentId, managing: bool) {
        self.push(user_id, agent_id, ArchiveKind::ManagingTrust { managing });
    }

    fn log_agent_connected(&self, user_id: UserId, agent_id: &AgentId) {
        self.push(user_id, agent_id, ArchiveKind::AgentConnected);
    }

    fn log_agent_died(&self, user_id: UserId, agent_id: &AgentId) {
        self.push(user_id, agent_id, ArchiveKind::AgentDied);
    }

    fn log_agent_stopped(&self, user_id: UserId, agent_id: &AgentId) {
        self.push(user_id, agent_id, ArchiveKind::AgentStopped);
    }
}

// ─── Policy ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StaticPolicy {
    snapshot: Mutex<PolicySnapshot>,
}

impl StaticPolicy {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Replace the policy. Sessions see it on their next refresh.
    pub fn set(&self, snapshot: PolicySnapshot) {
        *lock(&self.snapshot) = snapshot;
    }
}

impl DevicePolicy for StaticPolicy {
    fn trust_agents_disabled(&self, _user_id: UserId) -> bool {
        lock(&self.snapshot).trust_agents_disabled
    }

    fn trust_agent_configuration(
        &self,
        _agent_id: &AgentId,
        _user_id: UserId,
    ) -> Vec<AgentConfiguration> {
        lock(&self.snapshot).configuration.clone()
    }

    fn maximum_time_to_lock_ms(&self, _user_id: UserId) -> u64 {
        lock(&self.snapshot).max_time_to_lock_ms
    }
}

// ─── Bundle ──────────────────────────────────────────────────────

/// The four recording components, kept typed for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlatform {
    pub binder: Arc<LoopbackBinder>,
    pub manager: Arc<RecordingManager>,
    pub archive: Arc<RecordingArchive>,
    pub policy: Arc<StaticPolicy>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(snapshot: PolicySnapshot) -> Self {
        Self {
            policy: Arc::new(StaticPolicy::new(snapshot)),
            ..Self::default()
        }
    }

    /// Type-erased view to hand to a session.
    pub fn platform(&self) -> Platform {
        Platform {
            binder: self.binder.clone(),
            manager: self.manager.clone(),
            archive: self.archive.clone(),
            policy: self.policy.clone(),
        }
    }
}
