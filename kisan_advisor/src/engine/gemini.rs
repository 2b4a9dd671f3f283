//! Gemini (Google Generative Language API) execution engine.
//!
//! Uses the non-streaming `generateContent` endpoint and replays the reply
//! parts as an invocation stream.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{
    EngineError, EngineRequest, ExecutionEngine, InvocationResult, Part, ResultStream, Role,
    ToolDeclaration, Turn,
};
use crate::settings::LlmConfig;

pub struct GeminiEngine {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiEngine {
    pub fn new(api_key: String, config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }

    fn body(&self, request: &EngineRequest) -> Value {
        let contents: Vec<Value> = request.contents.iter().map(turn_json).collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            }
        });

        if !request.instruction.trim().is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.instruction }] });
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request.tools.iter().map(declaration_json).collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        body
    }
}

fn turn_json(turn: &Turn) -> Value {
    let role = match turn.role {
        Role::Model => "model",
        Role::User | Role::Tool => "user",
    };
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(t) if t.is_empty() => None,
            Part::Text(t) => Some(json!({ "text": t })),
            Part::InlineData { mime_type, data } => Some(json!({
                "inlineData": { "mimeType": mime_type, "data": STANDARD.encode(data) }
            })),
            Part::FunctionCall(call) => Some(json!({
                "functionCall": { "name": call.name, "args": call.args }
            })),
            Part::FunctionResponse { name, response } => Some(json!({
                "functionResponse": { "name": name, "response": { "content": response } }
            })),
        })
        .collect();
    json!({ "role": role, "parts": parts })
}

fn declaration_json(tool: &ToolDeclaration) -> Value {
    let mut properties = serde_json::Map::new();
    for p in &tool.parameters {
        properties.insert(
            p.name.clone(),
            json!({ "type": "STRING", "description": p.description }),
        );
    }
    let required: Vec<&str> = tool.parameters.iter().map(|p| p.name.as_str()).collect();
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": { "type": "OBJECT", "properties": properties, "required": required }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<ResponseFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Convert a decoded reply into the event sequence the core consumes.
fn into_results(reply: GenerateResponse) -> Vec<InvocationResult> {
    if let Some(err) = reply.error {
        return vec![InvocationResult::error(err.message)];
    }
    if let Some(reason) = reply.prompt_feedback.and_then(|f| f.block_reason) {
        return vec![InvocationResult::error(format!("prompt blocked: {}", reason))];
    }

    let Some(candidate) = reply.candidates.into_iter().next() else {
        return vec![InvocationResult::error("engine returned no candidates")];
    };

    let mut results = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            results.push(InvocationResult::function_call(call.name, call.args));
        } else if let Some(text) = part.text {
            results.push(InvocationResult::text(text));
        }
    }

    let has_calls = results.iter().any(|r| r.function_call.is_some());
    match candidate.finish_reason.as_deref() {
        Some("STOP") | Some("MAX_TOKENS") | None if !has_calls => {
            if let Some(last) = results.iter_mut().rev().find(|r| !r.text.is_empty()) {
                last.is_final = true;
            }
        }
        Some(reason) if results.is_empty() => {
            results.push(InvocationResult::error(format!("generation stopped: {}", reason)));
        }
        _ => {}
    }
    results
}

#[async_trait]
impl ExecutionEngine for GeminiEngine {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip(self, request), fields(capability = %request.capability, session = %request.session_id))]
    async fn invoke(&self, request: EngineRequest) -> Result<ResultStream, EngineError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(&request))
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<GenerateResponse>(&raw)
                .ok()
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or(raw);
            warn!("Gemini returned {} for {}", status, request.capability);
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let reply: GenerateResponse =
            serde_json::from_str(&raw).map_err(|e| EngineError::Decode(e.to_string()))?;

        let results = into_results(reply);
        debug!("Gemini produced {} results", results.len());
        Ok(stream::iter(results).boxed())
    }
}
