//! Interchangeable composition strategies over one capability set.

pub mod critic;
pub mod dispatcher;
pub mod parallel;
pub mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capability::{Capability, CapabilityHealth, InvocationPolicy};
use crate::catalog::Catalog;
use crate::engine::ExecutionEngine;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::query::Query;
use crate::settings::Settings;

pub use critic::{Gate, GateDecision, SelfCritic};
pub use dispatcher::Dispatcher;
pub use parallel::{ParallelOutcome, ParallelStage};
pub use pipeline::{Pipeline, PipelineRun, Stage, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Single coordinator choosing tools.
    Dispatcher,
    Sequential,
    Parallel,
    SelfCritic,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatcher => "dispatcher",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::SelfCritic => "self_critic",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "dispatcher" | "single" => Ok(Self::Dispatcher),
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "self_critic" | "critic" => Ok(Self::SelfCritic),
            other => Err(format!("Unknown coordination strategy: {}", other)),
        }
    }
}

/// Handles one farmer query end to end.
#[async_trait]
pub trait Coordinator: Send + Sync {
    fn name(&self) -> &str;

    fn strategy(&self) -> Strategy;

    async fn handle(&self, query: Query) -> OrchestrationResult<String>;
}

/// Every catalog descriptor bound to the engine, built once at start.
#[derive(Clone)]
pub struct CapabilitySet {
    by_name: BTreeMap<String, Arc<Capability>>,
}

impl CapabilitySet {
    pub fn new(catalog: &Catalog, engine: Arc<dyn ExecutionEngine>, policy: InvocationPolicy) -> Self {
        let mut by_name = BTreeMap::new();
        for name in catalog.names() {
            if let Ok(descriptor) = catalog.get(name) {
                let capability = Capability::new(descriptor.clone(), engine.clone(), policy.clone());
                by_name.insert(name.to_string(), Arc::new(capability));
            }
        }
        info!("Bound {} capabilities to engine '{}'", by_name.len(), engine.name());
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> OrchestrationResult<Arc<Capability>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestrationError::config(format!("unknown capability '{}'", name)))
    }

    pub fn health(&self) -> Vec<CapabilityHealth> {
        self.by_name.values().map(|c| c.health()).collect()
    }
}

/// Build the coordinator for `strategy`.
pub fn build(
    strategy: Strategy,
    capabilities: &CapabilitySet,
    settings: &Settings,
) -> OrchestrationResult<Arc<dyn Coordinator>> {
    let coordinator: Arc<dyn Coordinator> = match strategy {
        Strategy::Dispatcher => Arc::new(Dispatcher::kisan(
            capabilities,
            &settings.tools,
            settings.orchestrator.max_tool_rounds,
        )?),
        Strategy::Sequential => Arc::new(pipeline::kisan_sequential(capabilities)?),
        Strategy::Parallel => Arc::new(parallel::kisan_parallel(capabilities)?),
        Strategy::SelfCritic => Arc::new(SelfCritic::kisan(capabilities)?),
    };
    info!("Coordinator '{}' ready ({})", coordinator.name(), strategy);
    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategy_names() {
        assert_eq!("self-critic".parse::<Strategy>(), Ok(Strategy::SelfCritic));
        assert_eq!("Parallel".parse::<Strategy>(), Ok(Strategy::Parallel));
        assert!("round_robin".parse::<Strategy>().is_err());
        assert_eq!(Strategy::SelfCritic.to_string(), "self_critic");
    }
}
