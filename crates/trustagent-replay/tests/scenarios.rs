use std::fs;
use std::path::PathBuf;

use trustagent_replay::{Scenario, run_scenario};
use trustagent_runtime::SessionConfig;

fn scenarios_dir() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.join("../../fixtures/scenarios")
}

fn load_scenarios() -> Vec<Scenario> {
    let dir = scenarios_dir();
    let mut scenarios = Vec::new();
    if !dir.exists() {
        return scenarios;
    }
    let mut paths: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    for path in paths {
        let scenario = Scenario::load(&path).unwrap_or_else(|e| {
            panic!("failed to load scenario {:?}: {:#}", path, e);
        });
        scenarios.push(scenario);
    }
    scenarios
}

#[tokio::test(start_paused = true)]
async fn test_all_scenarios() {
    let scenarios = load_scenarios();
    assert!(
        !scenarios.is_empty(),
        "no scenarios found in {:?}",
        scenarios_dir()
    );

    let mut total_steps = 0;
    for scenario in &scenarios {
        let config = scenario.config.clone().unwrap_or_default();
        let records = run_scenario(scenario, config)
            .await
            .unwrap_or_else(|e| panic!("scenario '{}' failed: {:#}", scenario.name, e));
        assert_eq!(records.len(), scenario.steps.len());
        total_steps += records.len();
    }

    println!(
        "Replayed {} scenarios, {} steps total",
        scenarios.len(),
        total_steps
    );
}

#[tokio::test(start_paused = true)]
async fn records_carry_clamped_timeline() {
    let path = scenarios_dir().join("grant_clamped_by_policy.json");
    let scenario = Scenario::load(&path).unwrap();
    let records = run_scenario(&scenario, SessionConfig::default())
        .await
        .unwrap();

    let last = records.last().unwrap();
    assert_eq!(last.at_ms, 2_001);
    assert!(!last.snapshot.trusted);

    // The timeout step shows up in the audit trail of the advance step.
    let advance = &records[records.len() - 2];
    let json = serde_json::to_value(advance).unwrap();
    assert_eq!(json["action"], "advance");
    assert_eq!(json["archive"][0]["event"], "trust_timeout");
    assert_eq!(json["agent_calls"][0]["call"], "trust_timeout");
}

#[tokio::test(start_paused = true)]
async fn failed_expectation_names_the_field() {
    let scenario: Scenario = serde_json::from_str(
        r#"{
            "name": "wrong",
            "steps": [
                {"type": "connect"},
                {"type": "expect", "trusted": true}
            ]
        }"#,
    )
    .unwrap();
    let err = run_scenario(&scenario, SessionConfig::default())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("step 1"), "{message}");
    assert!(message.contains("trusted: expected true, got false"), "{message}");
}
