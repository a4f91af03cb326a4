//! Administrative policy reconciliation.
//!
//! Turns a snapshot read from the policy authority into state changes on
//! [`TrustState`] plus the configuration request the agent must receive.

use serde::{Deserialize, Serialize};

use crate::trust::{CeilingChange, Transition, TrustState};
use crate::types::{AgentConfiguration, ConfigToken, ConfigTokenSource};

/// Restrictions currently in force for one agent and user.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySnapshot {
    /// Trust agents are disabled by the administrator.
    pub trust_agents_disabled: bool,
    /// Configuration the agent must acknowledge before it may grant trust
    /// again. Only meaningful while `trust_agents_disabled`.
    pub configuration: Vec<AgentConfiguration>,
    /// Ceiling on any trust duration (0 = unlimited).
    pub max_time_to_lock_ms: u64,
}

/// Configuration call owed to the agent after reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigureRequest {
    /// Tell the agent there is no configuration to honour.
    Empty,
    /// Ask the agent to acknowledge `configuration`, correlated by `token`.
    AwaitAck {
        configuration: Vec<AgentConfiguration>,
        token: ConfigToken,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub disabled: bool,
    /// `None` when no agent is connected to receive it.
    pub configure: Option<ConfigureRequest>,
    pub ceiling: CeilingChange,
    pub transition: Transition,
}

/// Apply `snapshot` to `state`.
///
/// A disabled policy with a configuration payload opens a fresh handshake
/// (only when an agent is connected to answer it); the verdict stays masked
/// until the matching acknowledgement arrives.
pub fn reconcile(
    state: &mut TrustState,
    snapshot: PolicySnapshot,
    connected: bool,
    tokens: &mut ConfigTokenSource,
) -> PolicyOutcome {
    let disabled = snapshot.trust_agents_disabled;

    let configure = if !connected {
        None
    } else if disabled && !snapshot.configuration.is_empty() {
        let token = tokens.next_token();
        state.begin_config_handshake(token);
        Some(ConfigureRequest::AwaitAck {
            configuration: snapshot.configuration,
            token,
        })
    } else {
        Some(ConfigureRequest::Empty)
    };

    let ceiling = state.set_max_trust_duration(snapshot.max_time_to_lock_ms);
    let transition = state.set_policy_disabled(disabled);

    PolicyOutcome {
        disabled,
        configure,
        ceiling,
        transition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustGrant;
    use crate::types::TrustFlags;

    fn config() -> Vec<AgentConfiguration> {
        let mut map = serde_json::Map::new();
        map.insert("max_idle".to_string(), serde_json::json!(30));
        vec![AgentConfiguration(map)]
    }

    fn trusted_state() -> TrustState {
        let mut state = TrustState::new();
        state.set_managing_trust(true);
        state.grant(
            &TrustGrant {
                message: None,
                duration_ms: 0,
                flags: TrustFlags::NONE,
            },
            true,
        );
        state
    }

    #[test]
    fn enabled_policy_sends_empty_configuration() {
        let mut state = trusted_state();
        let mut tokens = ConfigTokenSource::new();
        let outcome = reconcile(&mut state, PolicySnapshot::default(), true, &mut tokens);
        assert!(!outcome.disabled);
        assert_eq!(outcome.configure, Some(ConfigureRequest::Empty));
        assert_eq!(outcome.ceiling, CeilingChange::Unchanged);
        assert!(!outcome.transition.changed());
        assert!(state.is_trusted());
    }

    #[test]
    fn disabled_with_configuration_opens_handshake() {
        let mut state = trusted_state();
        let mut tokens = ConfigTokenSource::new();
        let snapshot = PolicySnapshot {
            trust_agents_disabled: true,
            configuration: config(),
            max_time_to_lock_ms: 0,
        };
        let outcome = reconcile(&mut state, snapshot, true, &mut tokens);
        let Some(ConfigureRequest::AwaitAck { token, configuration }) = outcome.configure else {
            panic!("expected handshake");
        };
        assert_eq!(configuration, config());
        assert_eq!(state.pending_config(), Some(token));
        assert!(outcome.disabled);
        assert!(outcome.transition.changed());
        assert!(!state.is_trusted());
    }

    #[test]
    fn disabled_without_configuration_stays_disabled() {
        let mut state = trusted_state();
        let mut tokens = ConfigTokenSource::new();
        let snapshot = PolicySnapshot {
            trust_agents_disabled: true,
            ..PolicySnapshot::default()
        };
        let outcome = reconcile(&mut state, snapshot, true, &mut tokens);
        assert_eq!(outcome.configure, Some(ConfigureRequest::Empty));
        assert_eq!(state.pending_config(), None);
        assert!(state.policy_disabled());
    }

    #[test]
    fn disconnected_reconcile_records_policy_without_handshake() {
        let mut state = TrustState::new();
        let mut tokens = ConfigTokenSource::new();
        let snapshot = PolicySnapshot {
            trust_agents_disabled: true,
            configuration: config(),
            max_time_to_lock_ms: 4_000,
        };
        let outcome = reconcile(&mut state, snapshot, false, &mut tokens);
        assert_eq!(outcome.configure, None);
        assert_eq!(state.pending_config(), None);
        assert!(state.policy_disabled());
        assert_eq!(state.max_trust_duration_ms(), 4_000);
    }

    #[test]
    fn each_handshake_gets_a_fresh_token() {
        let mut state = TrustState::new();
        let mut tokens = ConfigTokenSource::new();
        let snapshot = PolicySnapshot {
            trust_agents_disabled: true,
            configuration: config(),
            max_time_to_lock_ms: 0,
        };
        reconcile(&mut state, snapshot.clone(), true, &mut tokens);
        let first = state.pending_config();
        reconcile(&mut state, snapshot, true, &mut tokens);
        assert_ne!(state.pending_config(), first);
    }

    #[test]
    fn snapshot_deserializes_partial_documents() {
        let snapshot: PolicySnapshot =
            serde_json::from_str(r#"{"max_time_to_lock_ms": 2000}"#).unwrap();
        assert_eq!(snapshot.max_time_to_lock_ms, 2_000);
        assert!(!snapshot.trust_agents_disabled);
        assert!(snapshot.configuration.is_empty());
    }
}
