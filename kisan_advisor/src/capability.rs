//! Capability descriptors, invocation policy and the final-answer rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::engine::{
    EngineError, EngineRequest, ExecutionEngine, ResultStream, ToolDeclaration, Turn,
};
use crate::settings::OrchestratorConfig;

/// Shape a capability promises to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputContract {
    #[default]
    FreeText,
    Json {
        fields: Vec<String>,
    },
}

/// Static description of a capability, loaded once at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instruction: String,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub output_contract: OutputContract,
    /// Model override; the engine default is used otherwise.
    #[serde(default)]
    pub model: Option<String>,
}

/// Timeout and retry bounds applied around every engine call.
#[derive(Debug, Clone)]
pub struct InvocationPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for InvocationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl InvocationPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl From<&OrchestratorConfig> for InvocationPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.capability_timeout_seconds),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Result of one capability invocation after final-answer selection.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed(String),
    /// Error-shaped text, already prefixed with the capability name.
    Failed(String),
}

impl InvocationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Completed(t) | Self::Failed(t) => t,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Completed(t) | Self::Failed(t) => t,
        }
    }
}

pub fn failure_text(capability: &str, message: impl std::fmt::Display) -> String {
    format!("Error from {}: {}", capability, message)
}

pub fn no_response_text(capability: &str) -> String {
    format!("No final text response from {}.", capability)
}

/// Capability health information
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityHealth {
    pub name: String,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
    errors: AtomicU64,
    total_ms: AtomicU64,
}

/// A named LLM-backed unit; stateless per invocation.
pub struct Capability {
    descriptor: CapabilityDescriptor,
    engine: Arc<dyn ExecutionEngine>,
    policy: InvocationPolicy,
    stats: Stats,
}

impl Capability {
    pub fn new(
        descriptor: CapabilityDescriptor,
        engine: Arc<dyn ExecutionEngine>,
        policy: InvocationPolicy,
    ) -> Self {
        Self {
            descriptor,
            engine,
            policy,
            stats: Stats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> &InvocationPolicy {
        &self.policy
    }

    fn request(
        &self,
        session_id: &str,
        instruction: String,
        contents: Vec<Turn>,
        tools: Vec<ToolDeclaration>,
    ) -> EngineRequest {
        EngineRequest {
            capability: self.descriptor.name.clone(),
            session_id: session_id.to_string(),
            model: self.descriptor.model.clone(),
            instruction,
            contents,
            tools,
        }
    }

    /// Start an engine call, retrying call-start failures with backoff.
    ///
    /// Error parts inside the returned stream are never retried.
    pub async fn start(
        &self,
        session_id: &str,
        instruction: String,
        contents: Vec<Turn>,
        tools: Vec<ToolDeclaration>,
    ) -> Result<ResultStream, EngineError> {
        let request = self.request(session_id, instruction, contents, tools);
        let mut attempt = 1;
        loop {
            match self.engine.invoke(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.policy.max_attempts => {
                    warn!(
                        "Engine call for '{}' failed (attempt {}/{}): {}",
                        self.name(),
                        attempt,
                        self.policy.max_attempts,
                        e
                    );
                    tokio::time::sleep(self.policy.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Invoke and select the final answer, bounded by the policy timeout.
    ///
    /// Never raises: faults come back as [`InvocationOutcome::Failed`].
    #[instrument(skip(self, instruction, contents), fields(capability = %self.descriptor.name))]
    pub async fn invoke(
        &self,
        session_id: &str,
        instruction: String,
        contents: Vec<Turn>,
    ) -> InvocationOutcome {
        let started = Instant::now();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let name = self.descriptor.name.clone();
        let run = async {
            match self.start(session_id, instruction, contents, Vec::new()).await {
                Ok(stream) => select_final(&name, stream).await,
                Err(e) => {
                    warn!("Exception during capability '{}' call: {}", name, e);
                    InvocationOutcome::Failed(failure_text(&name, e))
                }
            }
        };

        let outcome = match tokio::time::timeout(self.policy.timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let e = EngineError::Timeout(self.policy.timeout);
                warn!("Capability '{}' failed: {}", name, e);
                InvocationOutcome::Failed(failure_text(&name, e))
            }
        };

        self.record(started, outcome.is_failure());
        outcome
    }

    pub(crate) fn record(&self, started: Instant, failed: bool) {
        self.stats
            .total_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if failed {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_request(&self) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health(&self) -> CapabilityHealth {
        let requests = self.stats.requests.load(Ordering::Relaxed);
        let total_ms = self.stats.total_ms.load(Ordering::Relaxed);
        CapabilityHealth {
            name: self.descriptor.name.clone(),
            total_requests: requests,
            error_count: self.stats.errors.load(Ordering::Relaxed),
            average_response_time_ms: if requests == 0 {
                0.0
            } else {
                total_ms as f64 / requests as f64
            },
        }
    }
}

/// Consume `stream` and apply the final-answer rule.
///
/// The kept text is the last result that is final and non-empty. An error part
/// ends consumption immediately. Function-call parts are logged but never
/// satisfy finality; a stream that ends without a final text yields the
/// "no response" sentinel as a failure.
pub async fn select_final(capability: &str, mut stream: ResultStream) -> InvocationOutcome {
    let mut selected: Option<String> = None;
    let mut saw_function_call = false;
    let mut events = 0usize;

    while let Some(result) = stream.next().await {
        events += 1;
        if let Some(err) = &result.error {
            warn!("Error part from {}: {}", capability, err);
            return InvocationOutcome::Failed(failure_text(capability, err));
        }
        if let Some(call) = &result.function_call {
            debug!("Function call from {}: {}({})", capability, call.name, call.args);
            saw_function_call = true;
        }
        if result.is_final && !result.text.is_empty() {
            selected = Some(result.text);
        }
    }

    debug!("Collected {} events from {}", events, capability);
    match selected {
        Some(text) => {
            info!("Capability '{}' produced a final response", capability);
            InvocationOutcome::Completed(text)
        }
        None => {
            if saw_function_call {
                warn!(
                    "Capability '{}' emitted only function calls; check its configuration",
                    capability
                );
            }
            InvocationOutcome::Failed(no_response_text(capability))
        }
    }
}
