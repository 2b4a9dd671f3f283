//! Tools a coordinator can call by name with string arguments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::capability::{failure_text, Capability};
use crate::engine::{FunctionCall, ToolDeclaration};
use crate::query::Query;
use crate::session::Session;

#[async_trait]
pub trait Tool: Send + Sync {
    fn declaration(&self) -> ToolDeclaration;

    /// Execute a model-issued call. Failures are returned as text.
    async fn call(&self, call: &FunctionCall) -> String;
}

/// Wraps a [`Capability`] so it can be invoked with a single string argument.
pub struct ToolAdapter {
    tool_name: String,
    parameter: String,
    parameter_doc: String,
    capability: Arc<Capability>,
}

impl ToolAdapter {
    pub fn new(tool_name: &str, capability: Arc<Capability>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            parameter: "query".to_string(),
            parameter_doc: "The farmer's request or a description of the problem.".to_string(),
            capability,
        }
    }

    pub fn with_parameter(mut self, name: &str, doc: &str) -> Self {
        self.parameter = name.to_string();
        self.parameter_doc = doc.to_string();
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn capability(&self) -> &Arc<Capability> {
        &self.capability
    }

    /// Run the capability in a fresh, throwaway session and return its final text.
    ///
    /// Never raises; failures come back as text naming the capability.
    #[instrument(skip(self, input), fields(tool = %self.tool_name))]
    pub async fn invoke(&self, input: Query) -> String {
        let session = Session::new("tool");
        info!(
            "Calling capability '{}' in session {}",
            self.capability.name(),
            session.id()
        );
        let instruction = self.capability.descriptor().instruction.clone();
        self.capability
            .invoke(session.id(), instruction, vec![input.to_turn()])
            .await
            .into_text()
    }
}

#[async_trait]
impl Tool for ToolAdapter {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(&self.tool_name, &self.capability.descriptor().description)
            .param(&self.parameter, &self.parameter_doc)
    }

    async fn call(&self, call: &FunctionCall) -> String {
        match call.arg_str(&self.parameter) {
            // Text only: raw media never reaches a tool.
            Some(arg) => self.invoke(Query::text(arg)).await,
            None => failure_text(
                self.capability.name(),
                format!("missing string argument '{}'", self.parameter),
            ),
        }
    }
}

/// Named tools offered to a coordinator.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.declaration().name;
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.declaration())
            .collect()
    }

    /// Dispatch a call; unknown names are answered, not raised.
    pub async fn call(&self, call: &FunctionCall) -> String {
        match self.tools.get(&call.name) {
            Some(tool) => tool.call(call).await,
            None => {
                warn!("Model requested unknown tool '{}'", call.name);
                serde_json::json!({ "error": format!("Unknown tool '{}'", call.name) }).to_string()
            }
        }
    }
}
