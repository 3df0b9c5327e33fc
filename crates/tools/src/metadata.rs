//! Repository metadata tool.

use std::sync::Arc;

use async_trait::async_trait;
use proto::ToolError;
use serde_json::{Value, json};

use crate::Tool;
use crate::github::{GitHubClient, RepoScope, str_field};

/// Shapes the repository object into the fields worth showing the model.
pub(crate) fn metadata_output(repo: &Value) -> Result<Value, ToolError> {
    let text = |key: &str| repo.get(key).and_then(Value::as_str).map(str::to_string);
    let count = |key: &str| repo.get(key).and_then(Value::as_u64).unwrap_or(0);
    Ok(json!({
        "fullName": str_field(repo, "full_name")?,
        "description": text("description"),
        "homepage": text("homepage").filter(|h| !h.is_empty()),
        "language": text("language"),
        "defaultBranch": text("default_branch"),
        "stars": count("stargazers_count"),
        "forks": count("forks_count"),
        "openIssues": count("open_issues_count"),
        "topics": repo.get("topics").cloned().unwrap_or_else(|| json!([])),
        "license": repo.get("license").and_then(|l| l.get("spdx_id")).and_then(Value::as_str),
        "archived": repo.get("archived").and_then(Value::as_bool).unwrap_or(false),
        "createdAt": text("created_at"),
        "pushedAt": text("pushed_at"),
    }))
}

/// Fetches repository metadata (description, stars, language, ...).
pub struct RepositoryMetadataTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl RepositoryMetadataTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for RepositoryMetadataTool {
    fn name(&self) -> &str {
        "getRepositoryMetadata"
    }

    fn description(&self) -> &str {
        "Fetch repository metadata: description, primary language, default branch, \
         stars, forks, topics, and license."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let body = self
            .client
            .get_json(&self.scope.repo_segments(), &[])
            .await?;
        metadata_output(&body)
    }
}
