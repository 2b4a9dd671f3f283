//! Fan-out/fan-in stages.
//!
//! Every branch runs as its own task against the same read-only snapshot of
//! the session. The stage waits for all of them; their writes are merged
//! only after the join.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::AbortHandle;
use tracing::{info, instrument, warn};

use super::pipeline::{Pipeline, Step};
use super::CapabilitySet;
use crate::capability::{failure_text, InvocationOutcome};
use crate::catalog::names::{self, keys};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::query::{Media, Query};
use crate::session::Session;

pub struct ParallelStage {
    name: String,
    branches: Vec<Step>,
}

impl ParallelStage {
    pub fn new(name: impl Into<String>, branches: Vec<Step>) -> OrchestrationResult<Self> {
        let name = name.into();
        if branches.len() < 2 {
            return Err(OrchestrationError::config(format!(
                "parallel stage '{}' needs at least two branches",
                name
            )));
        }

        let mut keys = HashSet::new();
        for branch in &branches {
            let key = branch.output_key().ok_or_else(|| {
                OrchestrationError::config(format!(
                    "parallel branch '{}' must declare an output key",
                    branch.name()
                ))
            })?;
            if !keys.insert(key) {
                return Err(OrchestrationError::config(format!(
                    "parallel branches of '{}' both write '{}'",
                    name, key
                )));
            }
        }
        for branch in &branches {
            if let Some(key) = branch.reads().find(|k| keys.contains(k.as_str())) {
                return Err(OrchestrationError::config(format!(
                    "parallel branch '{}' reads sibling output '{}'",
                    branch.name(),
                    key
                )));
            }
        }

        Ok(Self { name, branches })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn branches(&self) -> &[Step] {
        &self.branches
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().filter_map(Step::output_key)
    }

    pub fn output_key_of(&self, capability: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|b| b.name() == capability)
            .and_then(Step::output_key)
    }

    /// Run the stage on its own with a fresh session.
    pub async fn run(&self, query: Query) -> OrchestrationResult<ParallelOutcome> {
        let mut session = Session::new(&self.name);
        session.put(keys::QUERY, query.prompt_text());
        self.execute(&session, query.media.as_ref()).await
    }

    #[instrument(skip(self, session, media), fields(stage = %self.name, session = %session.id()))]
    pub(crate) async fn execute(
        &self,
        session: &Session,
        media: Option<&Media>,
    ) -> OrchestrationResult<ParallelOutcome> {
        let snapshot = session.snapshot();
        let session_id: Arc<str> = Arc::from(session.id());

        let handles: Vec<_> = self
            .branches
            .iter()
            .cloned()
            .map(|branch| {
                let snapshot = snapshot.clone();
                let session_id = session_id.clone();
                let media = media.cloned();
                tokio::spawn(async move {
                    branch
                        .execute(&session_id, &snapshot, media.as_ref())
                        .await
                })
            })
            .collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        // Barrier: nothing is merged until every branch has finished.
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(self.branches.len());
        for (branch, joined) in self.branches.iter().zip(joined) {
            let outcome = match joined {
                Ok(result) => result?,
                Err(e) => {
                    warn!("Branch '{}' task aborted: {}", branch.name(), e);
                    InvocationOutcome::Failed(failure_text(branch.name(), format!("branch task aborted: {}", e)))
                }
            };
            results.push(BranchResult {
                capability: branch.name().to_string(),
                output_key: branch.output_key().unwrap_or_default().to_string(),
                outcome,
            });
        }

        let outcome = ParallelOutcome { results };
        info!(
            "Stage '{}' joined {} branches, {} failed",
            self.name,
            outcome.results.len(),
            outcome.failed().len()
        );
        Ok(outcome)
    }
}

/// Cancels branch tasks still running when the stage future is dropped.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct BranchResult {
    capability: String,
    output_key: String,
    outcome: InvocationOutcome,
}

/// Joined results of one fan-out, in branch order.
#[derive(Debug, Clone)]
pub struct ParallelOutcome {
    results: Vec<BranchResult>,
}

impl ParallelOutcome {
    pub fn results(&self) -> impl Iterator<Item = (&String, &InvocationOutcome)> {
        self.results.iter().map(|r| (&r.capability, &r.outcome))
    }

    pub fn get(&self, capability: &str) -> Option<&InvocationOutcome> {
        self.results
            .iter()
            .find(|r| r.capability == capability)
            .map(|r| &r.outcome)
    }

    pub fn failed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_failure())
            .map(|r| r.capability.clone())
            .collect()
    }

    pub fn succeeded(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_failure())
            .map(|r| (r.capability.clone(), r.outcome.text().to_string()))
            .collect()
    }

    pub fn joined_text(&self) -> String {
        self.results
            .iter()
            .map(|r| r.outcome.text())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Session writes, failed branches included as their error text.
    pub fn into_writes(self) -> Vec<(String, String)> {
        self.results
            .into_iter()
            .map(|r| (r.output_key, r.outcome.into_text()))
            .collect()
    }

    /// Capability name to result, or a partial failure naming the failed
    /// branches and carrying the successful ones.
    pub fn into_result(self) -> OrchestrationResult<BTreeMap<String, String>> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(self
                .results
                .into_iter()
                .map(|r| (r.capability, r.outcome.into_text()))
                .collect())
        } else {
            Err(OrchestrationError::PartialFailure {
                failed,
                succeeded: self.succeeded(),
            })
        }
    }
}

const SUMMARY_PROMPT: &str = "Farmer's question: {query}\n\nDiagnosis: {diagnosis_json}\n\nMarket: {market_json}\n\nScheme: {scheme_json}";

/// Market analysis and scheme lookup side by side.
pub fn market_and_scheme(capabilities: &CapabilitySet) -> OrchestrationResult<ParallelStage> {
    ParallelStage::new(
        "ParallelMarketSchemePlanner",
        vec![
            Step::new(capabilities.get(names::MARKET)?),
            Step::new(capabilities.get(names::SCHEME)?),
        ],
    )
}

/// Summary step reading every upstream output.
pub fn summary_step(capabilities: &CapabilitySet) -> OrchestrationResult<Step> {
    Ok(Step::new(capabilities.get(names::SUMMARY)?).with_prompt(SUMMARY_PROMPT))
}

/// Diagnose, then market and scheme concurrently, then summarize.
pub fn kisan_parallel(capabilities: &CapabilitySet) -> OrchestrationResult<Pipeline> {
    Pipeline::new(
        "KisanParallelWorkflow",
        vec![
            Step::new(capabilities.get(names::DIAGNOSIS)?).into(),
            market_and_scheme(capabilities)?.into(),
            summary_step(capabilities)?.into(),
        ],
    )
}
