//! Drydock Gate - pre-rollout validation for model versions
//!
//! Provides the validation gate that judges a freshly uploaded version:
//! - Runs the configured check sequence (schema, integrity, smoke)
//! - Produces a complete report; checks never short-circuit
//! - Drives the version to `validated` or `rejected` through the orchestrator

pub mod check;
pub mod gate;
pub mod harness;
pub mod runner;

// Re-export key types
pub use check::{CheckConfig, CheckKind};
pub use gate::{CheckOutcome, ValidationGate, ValidationReport};
pub use harness::{EchoHarness, SmokeHarness};
pub use runner::{run_validation, ValidationRun};
