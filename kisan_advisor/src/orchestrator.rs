//! Process-wide entry point: builds the engine, the capability set and the
//! configured coordinator, then routes every query through it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::capability::{CapabilityHealth, InvocationPolicy};
use crate::catalog::Catalog;
use crate::coordinator::{self, CapabilitySet, Coordinator, Strategy};
use crate::engine::{build_engine, ExecutionEngine};
use crate::error::OrchestrationResult;
use crate::query::Query;
use crate::settings::Settings;

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorHealth {
    pub coordinator: String,
    pub strategy: Strategy,
    pub engine: String,
    pub uptime_seconds: u64,
    pub capabilities: Vec<CapabilityHealth>,
}

pub struct Orchestrator {
    coordinator: Arc<dyn Coordinator>,
    capabilities: CapabilitySet,
    engine: Arc<dyn ExecutionEngine>,
    started: Instant,
}

impl Orchestrator {
    /// Build with the engine selected by `llm.provider`.
    pub fn new(settings: &Settings) -> Result<Self> {
        let engine = build_engine(&settings.llm)?;
        Self::with_engine(settings, engine)
    }

    #[instrument(skip(settings, engine))]
    pub fn with_engine(settings: &Settings, engine: Arc<dyn ExecutionEngine>) -> Result<Self> {
        let catalog = Catalog::load(settings.orchestrator.capabilities_file.as_deref())?;
        let policy = InvocationPolicy::from(&settings.orchestrator);
        let capabilities = CapabilitySet::new(&catalog, engine.clone(), policy);
        let strategy = settings.strategy()?;
        let coordinator = coordinator::build(strategy, &capabilities, settings)
            .with_context(|| format!("Failed to build the {} coordinator", strategy))?;

        info!(
            "Orchestrator initialized: coordinator '{}', engine '{}'",
            coordinator.name(),
            engine.name()
        );
        Ok(Self {
            coordinator,
            capabilities,
            engine,
            started: Instant::now(),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.coordinator.strategy()
    }

    pub fn coordinator_name(&self) -> &str {
        self.coordinator.name()
    }

    /// Run one query in its own session.
    #[instrument(skip(self, query), fields(strategy = %self.strategy()))]
    pub async fn handle(&self, query: Query) -> OrchestrationResult<String> {
        let started = Instant::now();
        let result = self.coordinator.handle(query).await;
        match &result {
            Ok(_) => info!("Query handled in {:?}", started.elapsed()),
            Err(e) => error!("Query failed after {:?}: {}", started.elapsed(), e),
        }
        result
    }

    pub fn health(&self) -> OrchestratorHealth {
        OrchestratorHealth {
            coordinator: self.coordinator.name().to_string(),
            strategy: self.strategy(),
            engine: self.engine.name().to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            capabilities: self.capabilities.health(),
        }
    }
}
