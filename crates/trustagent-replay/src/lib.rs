//! trustagent-replay: run scripted trust agent sessions against the
//! recording platform and report what every component saw.

pub mod scenario;

pub use scenario::{Expectation, Scenario, Step, StepRecord, run_scenario};
