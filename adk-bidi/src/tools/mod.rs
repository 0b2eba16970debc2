//! Tools the agent can call during a session.

mod calculator;
mod clock;

pub use calculator::{CalculatorTool, evaluate};
pub use clock::{CurrentTimeTool, format_japan_time, japan_now};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::ToolDefinition;
use crate::error::Result;

/// Name of the tool that ends a conversation.
pub const STOP_CONVERSATION: &str = "stop_conversation";

/// Executes one tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Definition advertised to the backend.
    fn definition(&self) -> ToolDefinition;

    /// Execute a tool call and return the result.
    async fn execute(&self, input: &Value) -> Result<Value>;
}

/// A simple function-based tool handler.
pub struct FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    definition: ToolDefinition,
    handler: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    /// Create a new function-based tool handler.
    pub fn new(definition: ToolDefinition, handler: F) -> Self {
        Self { definition, handler }
    }
}

#[async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        (self.handler)(input)
    }
}

/// Acknowledges a request to end the conversation. The bridge watches for
/// this tool name and stops the run once the result has been sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopConversationTool;

#[async_trait]
impl ToolHandler for StopConversationTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(STOP_CONVERSATION)
            .with_description("会話を終了します。ユーザーが会話の終了を求めたときに呼び出してください。")
            .with_parameters(json!({"type": "object", "properties": {}}))
    }

    async fn execute(&self, _input: &Value) -> Result<Value> {
        Ok(Value::String("会話を終了します".to_string()))
    }
}

/// Tools available to a session, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&String> = self.tools.keys().collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its definition's name, replacing any tool of
    /// the same name.
    pub fn register(&mut self, handler: impl ToolHandler + 'static) -> &mut Self {
        let handler: Arc<dyn ToolHandler> = Arc::new(handler);
        self.tools.insert(handler.definition().name, handler);
        self
    }

    /// Builder-style [`ToolRegistry::register`].
    pub fn with(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.register(handler);
        self
    }

    /// Look up a tool.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions of every tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The deployed agent's tool set: stop, clock and calculator.
pub fn default_tools() -> ToolRegistry {
    ToolRegistry::new().with(StopConversationTool).with(CurrentTimeTool).with(CalculatorTool)
}
