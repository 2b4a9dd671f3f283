//! Deterministic in-process engine.
//!
//! Each capability name maps to a handler that turns the request into a fixed
//! sequence of results. Every request is recorded so callers can inspect what
//! a capability actually received. `offline_demo()` wires canned agronomy
//! answers for every built-in capability so the service runs without an API
//! key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    EngineError, EngineRequest, ExecutionEngine, InvocationResult, Part, ResultStream, Role,
};
use crate::catalog::names;

pub type Handler = Arc<dyn Fn(&EngineRequest) -> Vec<InvocationResult> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedEngine {
    handlers: DashMap<String, Handler>,
    latency: DashMap<String, Duration>,
    failures: DashMap<String, usize>,
    calls: DashMap<String, Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `capability`.
    pub fn on<F>(self, capability: &str, handler: F) -> Self
    where
        F: Fn(&EngineRequest) -> Vec<InvocationResult> + Send + Sync + 'static,
    {
        self.handlers.insert(capability.to_string(), Arc::new(handler));
        self
    }

    /// Always answer `capability` with one final text.
    pub fn reply(self, capability: &str, text: &str) -> Self {
        let text = text.to_string();
        self.on(capability, move |_| vec![InvocationResult::final_text(text.clone())])
    }

    /// Delay every invocation of `capability` before its stream is returned.
    pub fn with_latency(self, capability: &str, delay: Duration) -> Self {
        self.latency.insert(capability.to_string(), delay);
        self
    }

    /// Fail the first `times` call starts of `capability` with a transport error.
    pub fn fail_first(self, capability: &str, times: usize) -> Self {
        self.failures.insert(capability.to_string(), times);
        self
    }

    /// Requests received so far by `capability`, oldest first.
    pub fn calls(&self, capability: &str) -> Vec<EngineRequest> {
        self.calls
            .get(capability)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self, capability: &str) -> usize {
        self.calls.get(capability).map(|c| c.len()).unwrap_or(0)
    }

    /// Canned answers for the built-in catalog.
    pub fn offline_demo() -> Self {
        let diagnosis = |_: &EngineRequest| {
            vec![InvocationResult::final_text(
                json!({
                    "disease": "Early blight",
                    "organic_remedy": "Spray neem oil every 7 days and remove infected leaves",
                    "chemical_remedy": "Mancozeb 75% WP at 2 g per litre",
                    "observed_symptoms_from_description": "Brown spots with concentric rings on lower leaves"
                })
                .to_string(),
            )]
        };
        let market = |req: &EngineRequest| {
            let text = req.user_text().to_lowercase();
            let crop = if text.contains("onion") { "Onion" } else { "Tomato" };
            let market = if text.contains("mandya") { "Mandya" } else { "Hubli" };
            vec![InvocationResult::final_text(
                json!({
                    "crop": crop,
                    "market": market,
                    "price_today": "₹1800/qtl",
                    "trend": "increasing",
                    "recommendation": "Hold"
                })
                .to_string(),
            )]
        };
        let scheme = |_: &EngineRequest| {
            vec![InvocationResult::final_text(
                json!({
                    "scheme_name": "Pradhan Mantri Fasal Bima Yojana",
                    "benefits": "Crop insurance against natural calamities",
                    "eligibility": "All farmers growing notified crops",
                    "how_to_apply": "Apply through the bank or the PMFBY portal",
                    "link": "https://pmfby.gov.in"
                })
                .to_string(),
            )]
        };
        // Pipeline steps carry prior outputs in the instruction, adapters in the user turn.
        let summary = |req: &EngineRequest| {
            let material = format!("{}\n{}", req.instruction, req.user_text());
            let text = summarize_plain(&material);
            let text = if text.is_empty() { req.user_text().trim().to_string() } else { text };
            vec![InvocationResult::final_text(text)]
        };

        Self::new()
            .on(names::ORCHESTRATOR, demo_coordinator)
            .on(names::DIAGNOSIS, diagnosis)
            .on(names::STEP_DIAGNOSE, diagnosis)
            .on(names::MARKET, market)
            .on(names::STEP_MARKET, market)
            .on(names::SCHEME, scheme)
            .on(names::SUMMARY, summary)
            .on(names::STEP_SUMMARIZE, summary)
            .reply(names::REVIEWER, "pass")
    }
}

/// Keyword router standing in for the coordinator model.
fn demo_coordinator(req: &EngineRequest) -> Vec<InvocationResult> {
    let Some(last) = req.last_turn() else {
        return vec![InvocationResult::error("empty conversation")];
    };

    if last.role == Role::Tool {
        let responses: Vec<(&str, &str)> = last
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionResponse { name, response } => Some((name.as_str(), response.as_str())),
                _ => None,
            })
            .collect();

        if let Some((_, text)) = responses.iter().find(|(n, _)| *n == names::tools::SUMMARIZE) {
            return vec![InvocationResult::final_text(*text)];
        }
        let joined = responses
            .iter()
            .map(|(_, r)| *r)
            .collect::<Vec<_>>()
            .join("\n");
        return vec![InvocationResult::function_call(
            names::tools::SUMMARIZE,
            json!({ "json_data": joined }),
        )];
    }

    if last.has_media() {
        let description = "Leaf shows brown spots with concentric rings and yellowing edges";
        return vec![
            InvocationResult::text(format!("Observed symptoms: {}", description)),
            InvocationResult::function_call(names::tools::DIAGNOSIS, json!({ "query": description })),
        ];
    }

    let text = last.text();
    let lower = text.to_lowercase();
    let tool = if ["price", "market", "sell", "mandi"].iter().any(|k| lower.contains(k)) {
        names::tools::MARKET
    } else if ["scheme", "subsidy", "loan", "insurance"].iter().any(|k| lower.contains(k)) {
        names::tools::SCHEME
    } else {
        names::tools::DIAGNOSIS
    };
    vec![InvocationResult::function_call(tool, json!({ "query": text }))]
}

/// Every JSON object embedded in `text`, in order of appearance.
pub(crate) fn embedded_json_objects(text: &str) -> Vec<Value> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(rel) = text[offset..].find('{') {
        let start = offset + rel;
        let mut iter = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match iter.next() {
            Some(Ok(value)) if value.is_object() => {
                found.push(value);
                offset = start + iter.byte_offset();
            }
            _ => offset = start + 1,
        }
    }
    found
}

fn summarize_plain(input: &str) -> String {
    let objects = embedded_json_objects(input);
    let mut lines = Vec::new();
    for obj in objects {
        if let Some(map) = obj.as_object() {
            for (key, value) in map {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                let mut label = key.replace('_', " ");
                if let Some(first) = label.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                lines.push(format!("- {}: {}", label, value));
            }
        }
    }
    lines.join("\n")
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: EngineRequest) -> Result<ResultStream, EngineError> {
        let capability = request.capability.clone();
        self.calls
            .entry(capability.clone())
            .or_default()
            .push(request.clone());

        if let Some(mut remaining) = self.failures.get_mut(&capability) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Transport(format!(
                    "injected failure for '{}'",
                    capability
                )));
            }
        }

        let handler = self
            .handlers
            .get(&capability)
            .map(|h| h.value().clone())
            .ok_or_else(|| EngineError::Unhandled(capability.clone()))?;

        let delay = self.latency.get(&capability).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let results = handler(&request);
        debug!("Scripted engine answered {} with {} results", capability, results.len());
        Ok(stream::iter(results).boxed())
    }
}
