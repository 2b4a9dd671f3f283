//! Single coordinator choosing tools.
//!
//! The coordinator capability sees the farmer's query (media included) and
//! the tool declarations. Each model turn either asks for tool calls, which
//! are executed in the order emitted and answered in one tool turn, or ends
//! the loop with a final text.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::{CapabilitySet, Coordinator, Strategy};
use crate::capability::Capability;
use crate::catalog::names;
use crate::engine::{EngineError, FunctionCall, Part, ResultStream, Role, Turn};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::query::Query;
use crate::session::Session;
use crate::settings::ToolsConfig;
use crate::tool::{ToolAdapter, ToolRegistry};
use crate::tools::{CropCalendar, WeatherTool};

pub const NO_RESPONSE: &str = "The agent could not generate a response.";

/// Everything one model turn produced.
#[derive(Debug, Default)]
struct ModelTurn {
    texts: Vec<String>,
    final_text: Option<String>,
    calls: Vec<FunctionCall>,
    error: Option<String>,
}

impl ModelTurn {
    async fn collect(mut stream: ResultStream) -> Self {
        let mut turn = Self::default();
        while let Some(result) = stream.next().await {
            if let Some(err) = result.error {
                turn.error = Some(err);
                break;
            }
            if let Some(call) = result.function_call {
                debug!("Coordinator requested {}({})", call.name, call.args);
                turn.calls.push(call);
            }
            if !result.text.is_empty() {
                if result.is_final {
                    turn.final_text = Some(result.text.clone());
                }
                turn.texts.push(result.text);
            }
        }
        turn
    }

    fn as_history(&self) -> Turn {
        let mut parts: Vec<Part> = self.texts.iter().cloned().map(Part::Text).collect();
        parts.extend(self.calls.iter().cloned().map(Part::FunctionCall));
        Turn {
            role: Role::Model,
            parts,
        }
    }
}

pub struct Dispatcher {
    brain: Arc<Capability>,
    tools: ToolRegistry,
    summarizer: Arc<ToolAdapter>,
    max_rounds: usize,
}

impl Dispatcher {
    pub fn new(
        brain: Arc<Capability>,
        tools: ToolRegistry,
        summarizer: Arc<ToolAdapter>,
        max_rounds: usize,
    ) -> OrchestrationResult<Self> {
        if max_rounds == 0 {
            return Err(OrchestrationError::config("max_tool_rounds must be at least 1"));
        }
        if !tools.contains(summarizer.tool_name()) {
            return Err(OrchestrationError::config(
                "the summarization tool must be offered to the coordinator",
            ));
        }
        Ok(Self {
            brain,
            tools,
            summarizer,
            max_rounds,
        })
    }

    /// The Kisan tool set. The weather tool is offered only with an API key.
    pub fn kisan(
        capabilities: &CapabilitySet,
        tools_config: &ToolsConfig,
        max_rounds: usize,
    ) -> OrchestrationResult<Self> {
        let summarizer = Arc::new(
            ToolAdapter::new(names::tools::SUMMARIZE, capabilities.get(names::SUMMARY)?)
                .with_parameter("json_data", "JSON output of another tool that needs summarizing."),
        );

        let diagnosis = ToolAdapter::new(names::tools::DIAGNOSIS, capabilities.get(names::DIAGNOSIS)?)
            .with_parameter("query", "Textual description of the symptoms.");

        let mut tools = ToolRegistry::new()
            .with(Arc::new(diagnosis))
            .with(Arc::new(ToolAdapter::new(names::tools::MARKET, capabilities.get(names::MARKET)?)))
            .with(Arc::new(ToolAdapter::new(names::tools::SCHEME, capabilities.get(names::SCHEME)?)))
            .with(summarizer.clone())
            .with(Arc::new(CropCalendar::new(&tools_config.crop_calendar_path)));

        match WeatherTool::from_config(tools_config) {
            Some(weather) => tools.register(Arc::new(weather)),
            None => info!("No weather API key configured; {} disabled", names::tools::WEATHER),
        }

        Self::new(capabilities.get(names::ORCHESTRATOR)?, tools, summarizer, max_rounds)
    }

    pub fn tool_names(&self) -> &[String] {
        self.tools.names()
    }

    /// One model turn, bounded by the coordinator's timeout.
    async fn round(&self, session: &Session, contents: &[Turn]) -> OrchestrationResult<ModelTurn> {
        let policy = self.brain.policy().clone();
        let instruction = self.brain.descriptor().instruction.clone();
        let declarations = self.tools.declarations();

        let run = async {
            let stream = self
                .brain
                .start(session.id(), instruction, contents.to_vec(), declarations)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(ModelTurn::collect(stream).await)
        };

        let started = Instant::now();
        self.brain.count_request();
        let result = match tokio::time::timeout(policy.timeout, run).await {
            Ok(Ok(turn)) => match turn.error.clone() {
                Some(err) => Err(err),
                None => Ok(turn),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Timeout(policy.timeout).to_string()),
        };
        self.brain.record(started, result.is_err());

        result.map_err(|message| {
            warn!("Coordinator capability '{}' failed: {}", self.brain.name(), message);
            OrchestrationError::Capability {
                name: self.brain.name().to_string(),
                message,
            }
        })
    }

    #[instrument(skip(self, query), fields(media = query.has_media()))]
    async fn dispatch(&self, query: Query) -> OrchestrationResult<String> {
        let session = Session::new("dispatcher");
        let mut contents = vec![query.to_turn()];

        for round in 1..=self.max_rounds {
            let turn = self.round(&session, &contents).await?;

            if turn.calls.is_empty() {
                let Some(text) = turn.final_text else {
                    warn!("Coordinator ended round {} without a final text", round);
                    return Ok(NO_RESPONSE.to_string());
                };
                info!("Coordinator answered after {} rounds", round);
                return Ok(self.ensure_plain_text(text).await);
            }

            contents.push(turn.as_history());
            let mut responses = Vec::with_capacity(turn.calls.len());
            for call in &turn.calls {
                info!("Round {}: calling tool '{}'", round, call.name);
                let response = self.tools.call(call).await;
                responses.push(Part::FunctionResponse {
                    name: call.name.clone(),
                    response,
                });
            }
            contents.push(Turn {
                role: Role::Tool,
                parts: responses,
            });
        }

        Err(OrchestrationError::ToolLoopExhausted {
            rounds: self.max_rounds,
        })
    }

    /// Raw JSON never reaches the farmer.
    async fn ensure_plain_text(&self, text: String) -> String {
        match as_json(&text) {
            Some(json) => {
                warn!("Coordinator returned raw JSON; summarizing it");
                self.summarizer.invoke(Query::text(json)).await
            }
            None => text,
        }
    }
}

/// The JSON payload of `text` if it is nothing but JSON (fences allowed).
fn as_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    if !(inner.starts_with('{') || inner.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(inner)
        .ok()
        .map(|_| inner.to_string())
}

#[async_trait]
impl Coordinator for Dispatcher {
    fn name(&self) -> &str {
        self.brain.name()
    }

    fn strategy(&self) -> Strategy {
        Strategy::Dispatcher
    }

    async fn handle(&self, query: Query) -> OrchestrationResult<String> {
        self.dispatch(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InvocationPolicy;
    use crate::catalog::Catalog;
    use crate::engine::{InvocationResult, ScriptedEngine};
    use serde_json::json;

    fn dispatcher(engine: ScriptedEngine, rounds: usize) -> (Arc<ScriptedEngine>, Dispatcher) {
        let engine = Arc::new(engine);
        let set = CapabilitySet::new(&Catalog::builtin(), engine.clone(), InvocationPolicy::default());
        let d = Dispatcher::kisan(&set, &ToolsConfig::default(), rounds).unwrap();
        (engine, d)
    }

    #[test]
    fn detects_bare_json() {
        assert!(as_json(r#"{"crop": "Tomato"}"#).is_some());
        assert_eq!(as_json("```json\n{\"a\": 1}\n```").as_deref(), Some("{\"a\": 1}"));
        assert!(as_json("- Disease: Early blight").is_none());
        assert!(as_json("{not json").is_none());
    }

    #[test]
    fn pipeline_is_never_offered_as_a_tool() {
        let (_, d) = dispatcher(ScriptedEngine::offline_demo(), 4);
        assert!(d.tool_names().iter().all(|n| !n.contains("pipeline")));
        assert!(!d.tool_names().contains(&names::tools::WEATHER.to_string()));
        assert!(d.tool_names().contains(&names::tools::CALENDAR.to_string()));
    }

    #[tokio::test]
    async fn raw_json_final_is_summarized() {
        let engine = ScriptedEngine::offline_demo().on(names::ORCHESTRATOR, |_| {
            vec![InvocationResult::final_text(r#"{"recommendation": "Sell"}"#)]
        });
        let (engine, d) = dispatcher(engine, 4);
        let out = d.handle(Query::text("tomato price")).await.unwrap();
        assert_eq!(out, "- Recommendation: Sell");
        assert_eq!(engine.call_count(names::SUMMARY), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_back_to_the_model() {
        // Echo the tool response back as the answer.
        let engine = ScriptedEngine::new().on(names::ORCHESTRATOR, |req| match req.last_turn() {
            Some(Turn { role: Role::Tool, parts }) => match parts.first() {
                Some(Part::FunctionResponse { response, .. }) => {
                    vec![InvocationResult::final_text(response.clone())]
                }
                _ => vec![InvocationResult::error("expected a function response")],
            },
            _ => vec![InvocationResult::function_call("crop_market_pipeline_tool", json!({}))],
        });
        let (_, d) = dispatcher(engine, 4);
        let out = d.handle(Query::text("everything please")).await.unwrap();
        assert!(out.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn endless_tool_calls_exhaust_the_loop() {
        let engine = ScriptedEngine::offline_demo().on(names::ORCHESTRATOR, |_| {
            vec![InvocationResult::function_call(names::tools::SCHEME, json!({ "query": "loan" }))]
        });
        let (_, d) = dispatcher(engine, 3);
        let err = d.handle(Query::text("loan")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolLoopExhausted { rounds: 3 }));
    }

    #[tokio::test]
    async fn coordinator_error_part_is_a_capability_error() {
        let engine = ScriptedEngine::new().on(names::ORCHESTRATOR, |_| vec![InvocationResult::error("quota")]);
        let (_, d) = dispatcher(engine, 3);
        let err = d.handle(Query::text("hi")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Capability { ref name, .. } if name == names::ORCHESTRATOR));
    }

    #[tokio::test]
    async fn no_final_text_yields_sentinel() {
        let engine = ScriptedEngine::new().on(names::ORCHESTRATOR, |_| vec![InvocationResult::text("thinking")]);
        let (_, d) = dispatcher(engine, 3);
        assert_eq!(d.handle(Query::text("hi")).await.unwrap(), NO_RESPONSE);
    }

    #[tokio::test]
    async fn slow_coordinator_times_out() {
        let engine = Arc::new(
            ScriptedEngine::offline_demo().with_latency(names::ORCHESTRATOR, std::time::Duration::from_millis(200)),
        );
        let policy = InvocationPolicy {
            timeout: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        let set = CapabilitySet::new(&Catalog::builtin(), engine, policy);
        let d = Dispatcher::kisan(&set, &ToolsConfig::default(), 3).unwrap();
        match d.handle(Query::text("hi")).await.unwrap_err() {
            OrchestrationError::Capability { message, .. } => assert!(message.starts_with("timed out after")),
            other => panic!("expected a capability error, got {:?}", other),
        }
    }
}
