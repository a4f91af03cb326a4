//! trustagent-replay: drive one trust agent session from a scenario file
//! on a paused clock and print a JSON record per step.

use anyhow::Context;
use clap::Parser;

use trustagent_replay::{Scenario, run_scenario};

mod cli;

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("TRUSTAGENT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let scenario = Scenario::load(&args.scenario)?;
    let config = args.session_config(scenario.config.as_ref());
    tracing::info!(scenario = %scenario.name, ?config, "trustagent-replay starting");

    // Paused clock: `advance` steps complete instantly and exactly.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .context("failed to build tokio runtime")?;
    let records = runtime.block_on(run_scenario(&scenario, config))?;

    for record in &records {
        let line = if args.pretty {
            serde_json::to_string_pretty(record)?
        } else {
            serde_json::to_string(record)?
        };
        println!("{line}");
    }
    Ok(())
}
