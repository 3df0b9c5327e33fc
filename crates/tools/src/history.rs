//! Commit and branch listing tools.

use std::sync::Arc;

use async_trait::async_trait;
use proto::ToolError;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::github::{GitHubClient, RepoScope, array, str_field};
use crate::{Tool, parse_args};

const DEFAULT_COMMITS: u64 = 20;
const MAX_PER_PAGE: u64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    per_page: Option<u64>,
}

/// Shapes a commit listing. Only the first line of each message is kept.
pub(crate) fn commits_output(body: &Value) -> Result<Value, ToolError> {
    let commits = array(body, "commits")?
        .iter()
        .map(|item| {
            let commit = item
                .get("commit")
                .ok_or_else(|| ToolError::MalformedResponse("missing 'commit'".to_string()))?;
            let message = str_field(commit, "message")?;
            let author = commit.get("author");
            Ok(json!({
                "sha": str_field(item, "sha")?,
                "message": message.lines().next().unwrap_or_default(),
                "author": author.and_then(|a| a.get("name")).and_then(Value::as_str).unwrap_or_default(),
                "date": author.and_then(|a| a.get("date")).and_then(Value::as_str).unwrap_or_default(),
            }))
        })
        .collect::<Result<Vec<_>, ToolError>>()?;
    Ok(Value::Array(commits))
}

/// Shapes a branch listing.
pub(crate) fn branches_output(body: &Value) -> Result<Value, ToolError> {
    let branches = array(body, "branches")?
        .iter()
        .map(|item| {
            Ok(json!({
                "name": str_field(item, "name")?,
                "protected": item.get("protected").and_then(Value::as_bool).unwrap_or(false),
            }))
        })
        .collect::<Result<Vec<_>, ToolError>>()?;
    Ok(Value::Array(branches))
}

/// Lists recent commits, optionally for one path or starting at a ref.
pub struct ListCommitsTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl ListCommitsTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for ListCommitsTool {
    fn name(&self) -> &str {
        "listCommits"
    }

    fn description(&self) -> &str {
        "List recent commits in the repository, newest first. \
         Optionally restrict to commits touching a path or starting from a branch/SHA."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Only commits touching this file or directory"
                },
                "sha": {
                    "type": "string",
                    "description": "Branch name or commit SHA to start listing from"
                },
                "perPage": {
                    "type": "integer",
                    "description": "Number of commits (1-100, default 20)"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: CommitArgs = parse_args(args)?;
        let mut query = vec![(
            "per_page",
            args.per_page
                .unwrap_or(DEFAULT_COMMITS)
                .clamp(1, MAX_PER_PAGE)
                .to_string(),
        )];
        if let Some(path) = args.path.filter(|p| !p.trim().is_empty()) {
            query.push(("path", path));
        }
        if let Some(sha) = args.sha.filter(|s| !s.trim().is_empty()) {
            query.push(("sha", sha));
        }
        let mut segments = self.scope.repo_segments();
        segments.push("commits");
        let body = self.client.get_json(&segments, &query).await?;
        commits_output(&body)
    }
}

/// Lists branches.
pub struct ListBranchesTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl ListBranchesTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for ListBranchesTool {
    fn name(&self) -> &str {
        "listBranches"
    }

    fn description(&self) -> &str {
        "List the branches of the repository."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let mut segments = self.scope.repo_segments();
        segments.push("branches");
        let body = self
            .client
            .get_json(&segments, &[("per_page", MAX_PER_PAGE.to_string())])
            .await?;
        branches_output(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_output_keeps_subject_line() {
        let body = json!([{
            "sha": "abc123",
            "commit": {
                "message": "Fix parser\n\nLonger body text",
                "author": {"name": "Ada", "date": "2024-01-02T03:04:05Z"}
            }
        }]);
        let output = commits_output(&body).expect("output");
        assert_eq!(output[0]["sha"], "abc123");
        assert_eq!(output[0]["message"], "Fix parser");
        assert_eq!(output[0]["author"], "Ada");
        assert_eq!(output[0]["date"], "2024-01-02T03:04:05Z");
    }

    #[test]
    fn commits_output_tolerates_missing_author() {
        let body = json!([{"sha": "def", "commit": {"message": "init"}}]);
        let output = commits_output(&body).expect("output");
        assert_eq!(output[0]["author"], "");
    }

    #[test]
    fn commits_output_rejects_non_array() {
        let err = commits_output(&json!({"message": "Not Found"})).expect_err("object");
        assert!(matches!(err, ToolError::MalformedResponse(_)));
    }

    #[test]
    fn branches_output_lists_names() {
        let body = json!([
            {"name": "main", "protected": true},
            {"name": "dev"}
        ]);
        let output = branches_output(&body).expect("output");
        assert_eq!(output[0]["protected"], true);
        assert_eq!(output[1]["name"], "dev");
        assert_eq!(output[1]["protected"], false);
    }
}
