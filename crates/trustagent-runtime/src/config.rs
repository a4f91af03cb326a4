use serde::{Deserialize, Serialize};
use trustagent_core::{EscrowGate, RestartPolicy};

/// Per-session settings supplied by the environment.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub restart: RestartPolicy,
    pub escrow: EscrowGate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustagent_core::GatePolarity;

    #[test]
    fn empty_document_is_default() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.restart.restart_timeout_ms, 300_000);
        assert!(!config.escrow.admits());
    }

    #[test]
    fn nested_overrides() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"restart": {"restart_timeout_ms": 2000}, "escrow": {"allow_escrow_token": true}}"#,
        )
        .unwrap();
        assert_eq!(config.restart.restart_timeout_ms, 2_000);
        assert_eq!(config.escrow.polarity, GatePolarity::RejectWhenDisallowed);
        assert!(config.escrow.admits());
    }
}
