//! Scripted sessions.
//!
//! A scenario is a JSON document listing the platform's side of a session
//! (connects, agent callbacks, manager requests, policy changes, elapsed
//! time) plus expectations on the resulting state. Running one produces a
//! record per step: the published snapshot and whatever the agent, the
//! archive, and the manager saw during that step.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};
use trustagent_core::{AgentId, ConfigToken, EscrowHandle, PolicySnapshot, TrustFlags, UserId};
use trustagent_runtime::recording::{
    AgentCall, ArchiveEntry, RecordingAgent, RecordingPlatform, TrustUpdate,
};
use trustagent_runtime::{
    AgentCallback, SessionConfig, SessionHandle, SessionSnapshot, TrustAgentSession,
};

fn default_agent_id() -> AgentId {
    AgentId::new("com.example/.ReplayAgent")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: AgentId,
    #[serde(default)]
    pub user_id: UserId,
    /// Session settings; command-line flags override these.
    #[serde(default)]
    pub config: Option<SessionConfig>,
    /// Policy in force when the session starts.
    #[serde(default)]
    pub policy: PolicySnapshot,
    #[serde(default)]
    pub device_locked: bool,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    // Platform
    Connect,
    Disconnect,
    SetPolicy {
        policy: PolicySnapshot,
    },
    Advance {
        ms: u64,
    },

    // Agent
    Grant {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        flags: u32,
    },
    Revoke,
    Managing {
        managing: bool,
    },
    /// Acknowledge a configuration. Without a token, answers the most
    /// recent handshake the agent received.
    AckConfig {
        #[serde(default = "yes")]
        success: bool,
        #[serde(default)]
        token: Option<u64>,
    },
    AddEscrowToken {
        token: String,
    },
    QueryEscrowToken {
        handle: i64,
    },
    RemoveEscrowToken {
        handle: i64,
    },
    UnlockWithToken {
        handle: i64,
        token: String,
    },

    // Manager
    UnlockAttempt {
        successful: bool,
    },
    UnlockLockout {
        timeout_ms: u64,
    },
    DeviceLocked,
    DeviceUnlocked,
    RefreshPolicy,
    Destroy,

    Expect(Expectation),
}

fn yes() -> bool {
    true
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SetPolicy { .. } => "set_policy",
            Self::Advance { .. } => "advance",
            Self::Grant { .. } => "grant",
            Self::Revoke => "revoke",
            Self::Managing { .. } => "managing",
            Self::AckConfig { .. } => "ack_config",
            Self::AddEscrowToken { .. } => "add_escrow_token",
            Self::QueryEscrowToken { .. } => "query_escrow_token",
            Self::RemoveEscrowToken { .. } => "remove_escrow_token",
            Self::UnlockWithToken { .. } => "unlock_with_token",
            Self::UnlockAttempt { .. } => "unlock_attempt",
            Self::UnlockLockout { .. } => "unlock_lockout",
            Self::DeviceLocked => "device_locked",
            Self::DeviceUnlocked => "device_unlocked",
            Self::RefreshPolicy => "refresh_policy",
            Self::Destroy => "destroy",
            Self::Expect(_) => "expect",
        }
    }
}

/// Checks against the session after every earlier step has settled.
/// Unset fields are not checked.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Expectation {
    pub trusted: Option<bool>,
    pub managing: Option<bool>,
    pub connected: Option<bool>,
    pub bound: Option<bool>,
    pub policy_disabled: Option<bool>,
    pub message: Option<String>,
    /// Total number of times the agent was told its trust timed out.
    pub trust_timeouts: Option<usize>,
    /// Total number of session resets requested from the manager.
    pub resets: Option<usize>,
}

impl Expectation {
    fn check(&self, snapshot: &SessionSnapshot, counts: &Counts) -> Vec<String> {
        let mut failures = Vec::new();
        let mut compare = |field: &str, expected: Option<String>, actual: String| {
            if let Some(expected) = expected {
                if expected != actual {
                    failures.push(format!("{field}: expected {expected}, got {actual}"));
                }
            }
        };
        compare("trusted", self.trusted.map(|v| v.to_string()), snapshot.trusted.to_string());
        compare(
            "managing",
            self.managing.map(|v| v.to_string()),
            snapshot.managing_trust.to_string(),
        );
        compare(
            "connected",
            self.connected.map(|v| v.to_string()),
            snapshot.connected.to_string(),
        );
        compare("bound", self.bound.map(|v| v.to_string()), snapshot.bound.to_string());
        compare(
            "policy_disabled",
            self.policy_disabled.map(|v| v.to_string()),
            snapshot.policy_disabled.to_string(),
        );
        compare(
            "message",
            self.message.clone(),
            snapshot.message.clone().unwrap_or_default(),
        );
        compare(
            "trust_timeouts",
            self.trust_timeouts.map(|v| v.to_string()),
            counts.trust_timeouts.to_string(),
        );
        compare("resets", self.resets.map(|v| v.to_string()), counts.resets.to_string());
        failures
    }
}

#[derive(Debug, Default)]
struct Counts {
    trust_timeouts: usize,
    resets: usize,
}

/// Output of one step, printed as one JSON line by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub action: &'static str,
    /// Virtual milliseconds since the scenario started.
    pub at_ms: u64,
    pub snapshot: SessionSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agent_calls: Vec<AgentCall>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub archive: Vec<ArchiveEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trust_updates: Vec<TrustUpdate>,
}

/// Drives one session through a scenario.
struct Replay {
    recording: RecordingPlatform,
    handle: SessionHandle,
    agent: Option<Arc<RecordingAgent>>,
    callback: Option<AgentCallback>,
    started: Instant,
    counts: Counts,
    archive_seen: usize,
    updates_seen: usize,
}

impl Replay {
    fn callback(&self, index: usize) -> Result<&AgentCallback> {
        match &self.callback {
            Some(callback) => Ok(callback),
            None => bail!("step {index}: no agent callback yet; connect first"),
        }
    }

    async fn apply(&mut self, index: usize, step: &Step) -> Result<()> {
        match step {
            Step::Connect => {
                let agent = Arc::new(RecordingAgent::new());
                if !self.recording.binder.connect(agent.clone()) {
                    bail!("step {index}: session is not bound");
                }
                self.handle.flush().await?;
                self.callback = agent.callback();
                self.agent = Some(agent);
            }
            Step::Disconnect => {
                if !self.recording.binder.disconnect() {
                    bail!("step {index}: session is not bound");
                }
            }
            Step::SetPolicy { policy } => self.recording.policy.set(policy.clone()),
            Step::Advance { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Step::Grant {
                message,
                duration_ms,
                flags,
            } => self.callback(index)?.grant_trust(
                message.clone(),
                *duration_ms,
                TrustFlags::from_bits(*flags),
            ),
            Step::Revoke => self.callback(index)?.revoke_trust(),
            Step::Managing { managing } => self.callback(index)?.set_managing_trust(*managing),
            Step::AckConfig { success, token } => {
                let token = match token {
                    Some(raw) => ConfigToken::new(*raw),
                    None => match self.agent.as_ref().and_then(|a| a.last_config_token()) {
                        Some(token) => token,
                        None => bail!("step {index}: agent never received a configuration token"),
                    },
                };
                self.callback(index)?.on_configure_completed(*success, token);
            }
            Step::AddEscrowToken { token } => {
                let user_id = self.handle.user_id();
                self.callback(index)?
                    .add_escrow_token(token.as_bytes().to_vec(), user_id);
            }
            Step::QueryEscrowToken { handle } => {
                let user_id = self.handle.user_id();
                self.callback(index)?
                    .is_escrow_token_active(EscrowHandle(*handle), user_id);
            }
            Step::RemoveEscrowToken { handle } => {
                let user_id = self.handle.user_id();
                self.callback(index)?
                    .remove_escrow_token(EscrowHandle(*handle), user_id);
            }
            Step::UnlockWithToken { handle, token } => {
                let user_id = self.handle.user_id();
                self.callback(index)?.unlock_user_with_token(
                    EscrowHandle(*handle),
                    token.as_bytes().to_vec(),
                    user_id,
                );
            }
            Step::UnlockAttempt { successful } => self.handle.on_unlock_attempt(*successful),
            Step::UnlockLockout { timeout_ms } => self.handle.on_unlock_lockout(*timeout_ms),
            Step::DeviceLocked => self.handle.on_device_locked(),
            Step::DeviceUnlocked => self.handle.on_device_unlocked(),
            Step::RefreshPolicy => {
                let disabled = self.handle.update_device_policy_features().await?;
                debug!(disabled, "policy refreshed");
            }
            Step::Destroy => self.handle.destroy(),
            Step::Expect(_) => {}
        }
        self.handle.flush().await?;
        Ok(())
    }

    fn record(&mut self, index: usize, step: &Step) -> StepRecord {
        let agent_calls = self
            .agent
            .as_ref()
            .map(|a| a.take_calls())
            .unwrap_or_default();
        self.counts.trust_timeouts += agent_calls
            .iter()
            .filter(|c| **c == AgentCall::TrustTimeout)
            .count();
        self.counts.resets = self.recording.manager.resets().len();

        let archive: Vec<_> = self
            .recording
            .archive
            .entries()
            .into_iter()
            .skip(self.archive_seen)
            .collect();
        self.archive_seen += archive.len();
        let trust_updates: Vec<_> = self
            .recording
            .manager
            .trust_updates()
            .into_iter()
            .skip(self.updates_seen)
            .collect();
        self.updates_seen += trust_updates.len();

        StepRecord {
            step: index,
            action: step.action(),
            at_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            snapshot: self.handle.snapshot(),
            agent_calls,
            archive,
            trust_updates,
        }
    }
}

/// Run `scenario` with `config` and return one record per step.
///
/// Expects a paused Tokio clock so `advance` steps are instant and exact.
/// Fails on the first unmet expectation.
pub async fn run_scenario(scenario: &Scenario, config: SessionConfig) -> Result<Vec<StepRecord>> {
    info!(scenario = %scenario.name, steps = scenario.steps.len(), "replay: starting");
    let recording = RecordingPlatform::with_policy(scenario.policy.clone());
    recording.manager.set_device_locked(scenario.device_locked);
    let handle = TrustAgentSession::start(
        scenario.agent_id.clone(),
        scenario.user_id,
        config,
        recording.platform(),
    )
    .with_context(|| format!("scenario {}: session did not start", scenario.name))?;

    let mut replay = Replay {
        recording,
        handle,
        agent: None,
        callback: None,
        started: Instant::now(),
        counts: Counts::default(),
        archive_seen: 0,
        updates_seen: 0,
    };

    let mut records = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        replay.apply(index, step).await?;
        let record = replay.record(index, step);
        if let Step::Expect(expectation) = step {
            let failures = expectation.check(&record.snapshot, &replay.counts);
            if !failures.is_empty() {
                bail!(
                    "scenario {} step {index}: {}",
                    scenario.name,
                    failures.join("; ")
                );
            }
        }
        records.push(record);
    }

    replay.handle.shutdown().await;
    info!(scenario = %scenario.name, "replay: finished");
    Ok(records)
}
