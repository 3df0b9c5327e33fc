//! Tool trait and the read-only GitHub repository tools.
//!
//! Every tool is bound to one [`RepoScope`] at construction time; the agent
//! runtime never lets the model pick a different repository.

pub mod contents;
pub mod github;
pub mod history;
pub mod metadata;
pub mod search;

pub use contents::{GetFileContentsTool, GetReadmeTool, ListDirectoryContentsTool};
pub use github::{DEFAULT_API_BASE, GitHubClient, RepoScope};
pub use history::{ListBranchesTool, ListCommitsTool};
pub use metadata::RepositoryMetadataTool;
pub use search::{SearchCodeTool, SearchIssuesTool};

use std::sync::Arc;

use async_trait::async_trait;
use proto::ToolError;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name exposed to the LLM.
    fn name(&self) -> &str;
    /// Human-readable description for tool selection.
    fn description(&self) -> &str;
    /// JSON schema for accepted tool arguments.
    fn parameters_schema(&self) -> Value;
    /// Executes the tool with the given JSON args.
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Builds the full repository tool set for one repository.
pub fn repository_tools(client: Arc<GitHubClient>, scope: RepoScope) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(GetFileContentsTool::new(client.clone(), scope.clone())),
        Arc::new(ListDirectoryContentsTool::new(client.clone(), scope.clone())),
        Arc::new(GetReadmeTool::new(client.clone(), scope.clone())),
        Arc::new(SearchCodeTool::new(client.clone(), scope.clone())),
        Arc::new(SearchIssuesTool::new(client.clone(), scope.clone())),
        Arc::new(ListCommitsTool::new(client.clone(), scope.clone())),
        Arc::new(ListBranchesTool::new(client.clone(), scope.clone())),
        Arc::new(RepositoryMetadataTool::new(client, scope)),
    ]
}

/// Deserializes tool arguments, mapping failures to [`ToolError::InvalidArgs`].
pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    // Providers send `null` for tools without parameters.
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}

/// Truncates text to at most `max_chars` characters, noting the cut.
pub(crate) fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_chars {
        return (text.to_string(), false);
    }
    let kept: String = text.chars().take(max_chars).collect();
    (
        format!("{kept}\n...[truncated: {} chars omitted]", total - max_chars),
        true,
    )
}
