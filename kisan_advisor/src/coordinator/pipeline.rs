//! Fixed sequential pipelines.
//!
//! Stages run strictly in order. A step reads session values through its
//! instruction and prompt templates and writes its final text under its output
//! key once it has completed. The session is seeded with the farmer's text
//! under `query` before the first stage; only the first stage also receives
//! the media.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{CapabilitySet, Coordinator, ParallelStage, Strategy};
use crate::capability::{Capability, InvocationOutcome};
use crate::catalog::names::{self, keys};
use crate::engine::{Part, Turn};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::query::{Media, Query};
use crate::session::Session;
use crate::template::Template;

const DEFAULT_PROMPT: &str = "{query}";

/// One capability invocation inside a composition.
#[derive(Clone)]
pub struct Step {
    capability: Arc<Capability>,
    instruction: Template,
    prompt: Template,
}

impl Step {
    pub fn new(capability: Arc<Capability>) -> Self {
        let instruction = Template::parse(capability.descriptor().instruction.clone());
        Self {
            capability,
            instruction,
            prompt: Template::parse(DEFAULT_PROMPT),
        }
    }

    /// User turn sent to the capability; `{query}` by default.
    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Template::parse(prompt);
        self
    }

    pub fn name(&self) -> &str {
        self.capability.name()
    }

    pub fn output_key(&self) -> Option<&str> {
        self.capability.descriptor().output_key.as_deref()
    }

    pub fn capability(&self) -> &Arc<Capability> {
        &self.capability
    }

    /// Session names this step reads.
    pub fn reads(&self) -> impl Iterator<Item = &String> {
        self.instruction.keys().iter().chain(self.prompt.keys())
    }

    fn render(&self, template: &Template, state: &HashMap<String, String>) -> OrchestrationResult<String> {
        template.render(state).map_err(|key| OrchestrationError::MissingKey {
            step: self.name().to_string(),
            key,
        })
    }

    /// Render against `state` and invoke. Capability faults come back inside
    /// the outcome; only a missing session value is an error.
    pub(crate) async fn execute(
        &self,
        session_id: &str,
        state: &HashMap<String, String>,
        media: Option<&Media>,
    ) -> OrchestrationResult<InvocationOutcome> {
        let instruction = self.render(&self.instruction, state)?;
        let mut turn = Turn::user_text(self.render(&self.prompt, state)?);
        if let Some(media) = media {
            turn.parts.push(Part::InlineData {
                mime_type: media.mime_type.clone(),
                data: media.data.clone(),
            });
        }
        Ok(self.capability.invoke(session_id, instruction, vec![turn]).await)
    }
}

pub enum Stage {
    Step(Step),
    Parallel(ParallelStage),
}

impl Stage {
    fn label(&self) -> String {
        match self {
            Self::Step(step) => step.name().to_string(),
            Self::Parallel(stage) => stage.name().to_string(),
        }
    }
}

impl From<Step> for Stage {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

impl From<ParallelStage> for Stage {
    fn from(stage: ParallelStage) -> Self {
        Self::Parallel(stage)
    }
}

/// What one step saw and wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: String,
    /// Session keys present when the step started, sorted.
    pub visible_keys: Vec<String>,
    pub wrote: Option<String>,
    pub failed: bool,
}

/// Completed pipeline run.
#[derive(Debug)]
pub struct PipelineRun {
    pub session: Session,
    pub output: String,
    pub steps: Vec<StepRecord>,
    /// Capabilities whose invocation failed (their output keys hold the error text).
    pub failed: Vec<String>,
}

pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    produced: HashSet<String>,
}

impl Pipeline {
    /// Check the data flow up front: every referenced name must be written by
    /// an earlier stage, and branches of one fan-out never see each other.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> OrchestrationResult<Self> {
        let name = name.into();
        if stages.is_empty() {
            return Err(OrchestrationError::config(format!("pipeline '{}' has no stages", name)));
        }

        let mut available: HashSet<String> = HashSet::from([keys::QUERY.to_string()]);
        for stage in &stages {
            match stage {
                Stage::Step(step) => {
                    check_reads(step, &available)?;
                    if let Some(key) = step.output_key() {
                        available.insert(key.to_string());
                    }
                }
                Stage::Parallel(parallel) => {
                    for branch in parallel.branches() {
                        check_reads(branch, &available)?;
                    }
                    available.extend(parallel.output_keys().map(str::to_string));
                }
            }
        }

        Ok(Self {
            name,
            stages,
            produced: available,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Session names present after a run, `query` included.
    pub fn produces(&self) -> &HashSet<String> {
        &self.produced
    }

    /// Run with a fresh session.
    pub async fn run(&self, query: &Query) -> OrchestrationResult<PipelineRun> {
        let mut session = Session::new(&self.name);
        session.put(keys::QUERY, query.prompt_text());
        self.run_in(session, query).await
    }

    #[instrument(skip(self, session, query), fields(pipeline = %self.name, session = %session.id()))]
    pub async fn run_in(&self, mut session: Session, query: &Query) -> OrchestrationResult<PipelineRun> {
        let mut output = String::new();
        let mut steps = Vec::new();
        let mut failed = Vec::new();

        for (index, stage) in self.stages.iter().enumerate() {
            let media = if index == 0 { query.media.as_ref() } else { None };
            debug!("Stage {} '{}' starting", index + 1, stage.label());

            match stage {
                Stage::Step(step) => {
                    let visible_keys = sorted_keys(&session);
                    let outcome = step.execute(session.id(), session.state(), media).await?;
                    let is_failure = outcome.is_failure();
                    if is_failure {
                        warn!("Step '{}' failed: {}", step.name(), outcome.text());
                        failed.push(step.name().to_string());
                    }
                    output = outcome.into_text();
                    if let Some(key) = step.output_key() {
                        session.put(key, output.clone());
                    }
                    steps.push(StepRecord {
                        step: step.name().to_string(),
                        visible_keys,
                        wrote: step.output_key().map(str::to_string),
                        failed: is_failure,
                    });
                }
                Stage::Parallel(parallel) => {
                    let visible_keys = sorted_keys(&session);
                    let outcome = parallel.execute(&session, media).await?;
                    for (name, result) in outcome.results() {
                        steps.push(StepRecord {
                            step: name.clone(),
                            visible_keys: visible_keys.clone(),
                            wrote: parallel.output_key_of(name).map(str::to_string),
                            failed: result.is_failure(),
                        });
                    }
                    let branch_failures = outcome.failed();
                    if !branch_failures.is_empty() {
                        warn!(
                            "Stage '{}' continues with partial results; failed: {}",
                            parallel.name(),
                            branch_failures.join(", ")
                        );
                    }
                    failed.extend(branch_failures);
                    output = outcome.joined_text();
                    session.merge(outcome.into_writes());
                }
            }
        }

        info!("Pipeline '{}' finished with {} failed steps", self.name, failed.len());
        Ok(PipelineRun {
            session,
            output,
            steps,
            failed,
        })
    }
}

fn check_reads(step: &Step, available: &HashSet<String>) -> OrchestrationResult<()> {
    for key in step.reads() {
        if !available.contains(key) {
            return Err(OrchestrationError::config(format!(
                "step '{}' reads '{}' which no earlier step writes",
                step.name(),
                key
            )));
        }
    }
    Ok(())
}

fn sorted_keys(session: &Session) -> Vec<String> {
    let mut keys: Vec<String> = session.state().keys().cloned().collect();
    keys.sort_unstable();
    keys
}

#[async_trait]
impl Coordinator for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> Strategy {
        if self.stages.iter().any(|s| matches!(s, Stage::Parallel(_))) {
            Strategy::Parallel
        } else {
            Strategy::Sequential
        }
    }

    async fn handle(&self, query: Query) -> OrchestrationResult<String> {
        Ok(self.run(&query).await?.output)
    }
}

/// Diagnose, then market analysis informed by the diagnosis, then summarize.
pub fn kisan_sequential(capabilities: &CapabilitySet) -> OrchestrationResult<Pipeline> {
    Pipeline::new(
        "KisanSequentialWorkflow",
        vec![
            Step::new(capabilities.get(names::STEP_DIAGNOSE)?).into(),
            Step::new(capabilities.get(names::STEP_MARKET)?).into(),
            Step::new(capabilities.get(names::STEP_SUMMARIZE)?).into(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDescriptor, InvocationPolicy, OutputContract};
    use crate::engine::{InvocationResult, ScriptedEngine};

    fn cap(engine: &Arc<ScriptedEngine>, name: &str, instruction: &str, key: Option<&str>) -> Arc<Capability> {
        Arc::new(Capability::new(
            CapabilityDescriptor {
                name: name.into(),
                description: String::new(),
                instruction: instruction.into(),
                output_key: key.map(str::to_string),
                output_contract: OutputContract::FreeText,
                model: None,
            },
            engine.clone(),
            InvocationPolicy::default(),
        ))
    }

    #[test]
    fn reading_a_later_output_is_a_config_error() {
        let engine = Arc::new(ScriptedEngine::new());
        let err = Pipeline::new(
            "bad",
            vec![
                Step::new(cap(&engine, "A", "Use {b_out}", Some("a_out"))).into(),
                Step::new(cap(&engine, "B", "plain", Some("b_out"))).into(),
            ],
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("b_out"));
    }

    #[test]
    fn a_step_cannot_read_its_own_output() {
        let engine = Arc::new(ScriptedEngine::new());
        let own = Pipeline::new(
            "own",
            vec![Step::new(cap(&engine, "A", "Refine {a_out}", Some("a_out"))).into()],
        );
        assert!(own.is_err());
    }

    #[tokio::test]
    async fn later_steps_see_rendered_prior_outputs() {
        let engine = Arc::new(
            ScriptedEngine::new()
                .reply("Diagnose", "late blight")
                .on("Market", |req| {
                    vec![InvocationResult::final_text(format!("priced after [{}]", req.instruction))]
                }),
        );
        let pipeline = Pipeline::new(
            "seq",
            vec![
                Step::new(cap(&engine, "Diagnose", "diagnose", Some("diagnosis_json"))).into(),
                Step::new(cap(&engine, "Market", "Based on {diagnosis_json}", None)).into(),
            ],
        )
        .unwrap();

        let run = pipeline.run(&Query::text("tomato leaves are black")).await.unwrap();
        assert_eq!(run.output, "priced after [Based on late blight]");
        assert_eq!(run.session.get("diagnosis_json"), Some("late blight"));
        assert_eq!(run.steps[0].visible_keys, ["query"]);
        assert_eq!(run.steps[1].visible_keys, ["diagnosis_json", "query"]);
        assert_eq!(engine.calls("Market")[0].user_text(), "tomato leaves are black");
    }

    #[tokio::test]
    async fn only_the_first_stage_receives_media() {
        let engine = Arc::new(ScriptedEngine::new().reply("A", "a").reply("B", "b"));
        let pipeline = Pipeline::new(
            "media",
            vec![
                Step::new(cap(&engine, "A", "x", Some("a_out"))).into(),
                Step::new(cap(&engine, "B", "y", None)).into(),
            ],
        )
        .unwrap();
        let query = Query::media(Media::new("image/jpeg", vec![0xff, 0xd8]));
        pipeline.run(&query).await.unwrap();
        assert!(engine.calls("A")[0].has_media());
        assert!(!engine.calls("B")[0].has_media());
    }

    #[tokio::test]
    async fn failed_step_leaves_error_text_and_run_continues() {
        let engine = Arc::new(
            ScriptedEngine::new()
                .on("A", |_| vec![InvocationResult::error("quota")])
                .on("B", |req| vec![InvocationResult::final_text(req.instruction.clone())]),
        );
        let pipeline = Pipeline::new(
            "partial",
            vec![
                Step::new(cap(&engine, "A", "x", Some("a_out"))).into(),
                Step::new(cap(&engine, "B", "Saw: {a_out}", None)).into(),
            ],
        )
        .unwrap();
        let run = pipeline.run(&Query::text("hi")).await.unwrap();
        assert_eq!(run.failed, ["A"]);
        assert_eq!(run.output, "Saw: Error from A: quota");
    }

    #[tokio::test]
    async fn builtin_sequential_pipeline_validates() {
        let engine: Arc<ScriptedEngine> = Arc::new(ScriptedEngine::offline_demo());
        let set = CapabilitySet::new(&crate::catalog::Catalog::builtin(), engine, InvocationPolicy::default());
        let pipeline = kisan_sequential(&set).unwrap();
        assert_eq!(pipeline.strategy(), Strategy::Sequential);
        let out = pipeline.handle(Query::text("yellow spots on tomato leaves")).await.unwrap();
        assert!(!out.trim_start().starts_with('{'));
    }
}
