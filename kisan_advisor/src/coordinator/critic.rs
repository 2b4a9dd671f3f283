//! Self-critique: pipeline, review, then a deterministic gate.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::parallel::{market_and_scheme, summary_step};
use super::pipeline::{Pipeline, Step};
use super::{CapabilitySet, Coordinator, Strategy};
use crate::catalog::names::{self, keys};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::query::Query;
use crate::session::Session;

pub const VALIDATED_PREFIX: &str = "✅ Final validated output:\n\n";
pub const REJECTION_MESSAGE: &str =
    "❌ The summary did not pass quality review. Please improve the structure or completeness.";

const REVIEW_PROMPT: &str = "Grade the advice above. Answer pass or fail.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritiqueState {
    RunningPipeline,
    Reviewing,
    Accepted,
    Rejected,
}

impl fmt::Display for CritiqueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RunningPipeline => "RUNNING_PIPELINE",
            Self::Reviewing => "REVIEWING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Carries the stored summary.
    Accepted(String),
    Rejected,
}

impl GateDecision {
    pub fn state(&self) -> CritiqueState {
        match self {
            Self::Accepted(_) => CritiqueState::Accepted,
            Self::Rejected => CritiqueState::Rejected,
        }
    }

    pub fn into_message(self) -> String {
        match self {
            Self::Accepted(summary) => format!("{}{}", VALIDATED_PREFIX, summary),
            Self::Rejected => REJECTION_MESSAGE.to_string(),
        }
    }
}

/// Reads the verdict and nothing else. Never calls a model.
pub struct Gate;

impl Gate {
    pub fn decide(state: &HashMap<String, String>) -> GateDecision {
        match state.get(keys::REVIEW_STATUS).map(String::as_str) {
            Some("pass") => GateDecision::Accepted(
                state.get(keys::SUMMARY).cloned().unwrap_or_default(),
            ),
            _ => GateDecision::Rejected,
        }
    }
}

/// `" Pass." -> "pass"`; anything wordier stays as written and fails the gate.
pub fn normalize_verdict(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '.' | '!') || c.is_whitespace())
        .to_lowercase()
}

pub struct SelfCritic {
    name: String,
    pipeline: Pipeline,
    reviewer: Step,
}

impl SelfCritic {
    pub fn new(name: impl Into<String>, pipeline: Pipeline, reviewer: Step) -> OrchestrationResult<Self> {
        let name = name.into();
        if !pipeline.produces().contains(keys::SUMMARY) {
            return Err(OrchestrationError::config(format!(
                "pipeline '{}' never writes '{}'",
                pipeline.name(),
                keys::SUMMARY
            )));
        }
        if let Some(key) = reviewer.reads().find(|k| !pipeline.produces().contains(k.as_str())) {
            return Err(OrchestrationError::config(format!(
                "reviewer '{}' reads '{}' which the pipeline never writes",
                reviewer.name(),
                key
            )));
        }
        Ok(Self {
            name,
            pipeline,
            reviewer,
        })
    }

    /// Diagnosis, market and scheme in parallel, summary, review.
    pub fn kisan(capabilities: &CapabilitySet) -> OrchestrationResult<Self> {
        let pipeline = Pipeline::new(
            "AgriParallelAnalysis",
            vec![
                Step::new(capabilities.get(names::DIAGNOSIS)?).into(),
                market_and_scheme(capabilities)?.into(),
                summary_step(capabilities)?.into(),
            ],
        )?;
        let reviewer = Step::new(capabilities.get(names::REVIEWER)?).with_prompt(REVIEW_PROMPT);
        Self::new("KisanSelfCriticWorkflow", pipeline, reviewer)
    }

    /// Run the state machine and return the final session with the decision.
    #[instrument(skip(self, query), fields(coordinator = %self.name))]
    pub async fn evaluate(&self, query: &Query) -> OrchestrationResult<(Session, GateDecision)> {
        let mut state = CritiqueState::RunningPipeline;
        info!("Self-critique state: {}", state);
        let run = self.pipeline.run(query).await?;
        let mut session = run.session;

        state = transition(state, CritiqueState::Reviewing);
        let outcome = self.reviewer.execute(session.id(), session.state(), None).await?;
        let verdict = normalize_verdict(outcome.text());
        session.put(keys::REVIEW_STATUS, verdict);

        let decision = Gate::decide(session.state());
        transition(state, decision.state());
        Ok((session, decision))
    }
}

fn transition(from: CritiqueState, to: CritiqueState) -> CritiqueState {
    info!("Self-critique state: {} -> {}", from, to);
    to
}

#[async_trait]
impl Coordinator for SelfCritic {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> Strategy {
        Strategy::SelfCritic
    }

    async fn handle(&self, query: Query) -> OrchestrationResult<String> {
        let (_, decision) = self.evaluate(&query).await?;
        Ok(decision.into_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn pass_emits_prefixed_summary() {
        let decision = Gate::decide(&state(&[("review_status", "pass"), ("summary", "- Market: Hold")]));
        assert_eq!(decision.into_message(), "✅ Final validated output:\n\n- Market: Hold");
    }

    #[test]
    fn anything_else_rejects_without_the_summary() {
        for verdict in ["fail", "PASS", "pass with notes", ""] {
            let decision = Gate::decide(&state(&[("review_status", verdict), ("summary", "secret")]));
            assert_eq!(decision, GateDecision::Rejected);
            assert!(!decision.into_message().contains("secret"));
        }
        assert_eq!(Gate::decide(&state(&[("summary", "secret")])), GateDecision::Rejected);
    }

    #[test]
    fn verdicts_are_normalized() {
        assert_eq!(normalize_verdict(" Pass.\n"), "pass");
        assert_eq!(normalize_verdict("\"fail\""), "fail");
        assert_eq!(normalize_verdict("It passes"), "it passes");
    }
}
