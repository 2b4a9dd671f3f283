//! The LLM execution engine boundary.
//!
//! The core treats inference as an opaque capability: given an instruction and
//! a conversation, the engine yields a lazy, finite sequence of
//! [`InvocationResult`]s. Each call produces a fresh stream; streams are not
//! resumable.

pub mod gemini;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::settings::LlmConfig;

pub use gemini::GeminiEngine;
pub use scripted::ScriptedEngine;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self { name: name.into(), args }
    }

    /// String argument by name, if present.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Arc<[u8]> },
    FunctionCall(FunctionCall),
    FunctionResponse { name: String, response: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn has_media(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::InlineData { .. }))
    }

    /// Concatenated text parts of this turn.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A single string-typed parameter of a declared tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
}

/// What the coordinator's model is told about an invocable tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.parameters.push(ToolParameter {
            name: name.into(),
            description: description.into(),
        });
        self
    }
}

/// Everything an engine needs for one capability invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub capability: String,
    pub session_id: String,
    pub model: Option<String>,
    /// Rendered instruction; empty means "no system instruction".
    pub instruction: String,
    pub contents: Vec<Turn>,
    pub tools: Vec<ToolDeclaration>,
}

impl EngineRequest {
    pub fn has_media(&self) -> bool {
        self.contents.iter().any(Turn::has_media)
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.contents.last()
    }

    /// Text of every user turn, in order.
    pub fn user_text(&self) -> String {
        self.contents
            .iter()
            .filter(|t| t.role == Role::User)
            .map(Turn::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One event produced by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationResult {
    pub text: String,
    pub is_final: bool,
    pub function_call: Option<FunctionCall>,
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            ..Default::default()
        }
    }

    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            function_call: Some(FunctionCall::new(name, args)),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

pub type ResultStream = BoxStream<'static, InvocationResult>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode engine response: {0}")]
    Decode(String),

    #[error("no handler registered for capability '{0}'")]
    Unhandled(String),

    #[error("timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: EngineRequest) -> Result<ResultStream, EngineError>;
}

/// Build the engine selected by `llm.provider`.
pub fn build_engine(config: &LlmConfig) -> Result<Arc<dyn ExecutionEngine>> {
    match config.provider.as_str() {
        "gemini" => {
            let key = config
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("Gemini provider requires an API key"))?;
            Ok(Arc::new(GeminiEngine::new(key, config)))
        }
        "scripted" => Ok(Arc::new(ScriptedEngine::offline_demo())),
        other => Err(anyhow!("Unknown LLM provider: {}", other)),
    }
}
