//! Tool registry used by the conversation loop to list and execute tools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proto::{ToolDefinition, ToolError};
use serde_json::Value;
use tools::Tool;
use tracing::debug;

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    requires_confirmation: HashSet<String>,
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            requires_confirmation: HashSet::new(),
        }
    }

    /// Creates a registry holding the given tools.
    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register_arc(tool);
        }
        registry
    }

    /// Register a tool
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!("Registering tool: {name}");
        self.tools.insert(name, tool);
    }

    /// Marks a tool as needing a human decision before it runs.
    pub fn require_confirmation(&mut self, name: impl Into<String>) {
        self.requires_confirmation.insert(name.into());
    }

    /// Whether the named tool needs a human decision before it runs.
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.requires_confirmation.contains(name)
    }

    /// Get tool definitions for the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters_schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool after checking its input against the declared schema.
    pub async fn execute(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        // Providers send `null` for tools without parameters.
        let input = if input.is_null() {
            Value::Object(Default::default())
        } else {
            input
        };
        validate_against_schema(&tool.parameters_schema(), &input)?;
        debug!("Executing tool: {name}");
        tool.execute(input).await
    }

    /// Returns the list of registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_against_schema(schema: &Value, input: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| ToolError::ExecutionFailed(format!("invalid tool schema: {e}")))?;
    if validator.is_valid(input) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    Err(ToolError::InvalidArgs(errors.join("; ")))
}
