//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::Parser;
use trustagent_runtime::SessionConfig;

#[derive(Parser)]
#[command(
    name = "trustagent-replay",
    about = "Replay a trust agent session scenario and print each step as JSON"
)]
pub struct Cli {
    /// Scenario file (JSON)
    pub scenario: PathBuf,

    /// Window the agent gets to (re)connect before the session is reset
    #[arg(long, env = "TRUSTAGENT_RESTART_TIMEOUT_MS")]
    pub restart_timeout_ms: Option<u64>,

    /// Admit escrow token requests from the agent
    #[arg(long)]
    pub allow_escrow_token: bool,

    /// Pretty-print each record instead of one JSON object per line
    #[arg(long)]
    pub pretty: bool,
}

impl Cli {
    /// Defaults, then the scenario's own settings, then flags.
    pub fn session_config(&self, scenario: Option<&SessionConfig>) -> SessionConfig {
        let mut config = scenario.cloned().unwrap_or_default();
        if let Some(ms) = self.restart_timeout_ms {
            config.restart.restart_timeout_ms = ms;
        }
        if self.allow_escrow_token {
            config.escrow.allow_escrow_token = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_scenario_config() {
        let cli = Cli::parse_from([
            "trustagent-replay",
            "s.json",
            "--restart-timeout-ms",
            "1000",
            "--allow-escrow-token",
        ]);
        let mut scenario = SessionConfig::default();
        scenario.restart.restart_timeout_ms = 5_000;
        let config = cli.session_config(Some(&scenario));
        assert_eq!(config.restart.restart_timeout_ms, 1_000);
        assert!(config.escrow.allow_escrow_token);
    }

    #[test]
    fn scenario_config_kept_without_flags() {
        let cli = Cli::parse_from(["trustagent-replay", "s.json"]);
        let mut scenario = SessionConfig::default();
        scenario.restart.restart_timeout_ms = 5_000;
        assert_eq!(
            cli.session_config(Some(&scenario)).restart.restart_timeout_ms,
            5_000
        );
        assert_eq!(cli.session_config(None), SessionConfig::default());
    }
}
