//! Error types for the orchestration core.
//!
//! Capability-level faults are *not* errors at this layer: they travel as
//! error-shaped text so composition can continue. Only the variants below
//! abort a coordinator run.

use std::collections::BTreeMap;
use thiserror::Error;

/// Fatal (or explicitly propagated) orchestration failures.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// Misconfigured catalog or pipeline. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A step template referenced a session value that no prior step wrote.
    #[error("step '{step}' references undefined session value '{key}'")]
    MissingKey { step: String, key: String },

    /// One or more fan-out branches failed; the successful ones are kept.
    #[error("parallel branches failed: {}", failed.join(", "))]
    PartialFailure {
        failed: Vec<String>,
        succeeded: BTreeMap<String, String>,
    },

    /// The coordinator's own reasoning capability failed.
    #[error("capability '{name}' failed: {message}")]
    Capability { name: String, message: String },

    #[error("coordinator did not finish within {rounds} tool rounds")]
    ToolLoopExhausted { rounds: usize },
}

impl OrchestrationError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the classes that must abort a run outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::MissingKey { .. })
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
