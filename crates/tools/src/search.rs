//! Search tools: code search and issue/pull-request search, both restricted to one repository.

use std::sync::Arc;

use async_trait::async_trait;
use proto::ToolError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::github::{GitHubClient, RepoScope, array, str_field};
use crate::{Tool, parse_args};

const MAX_RESULTS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArgs {
    query: String,
    #[serde(default)]
    state: Option<IssueState>,
    #[serde(default)]
    per_page: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum IssueState {
    Open,
    Closed,
    All,
}

/// Appends the repository qualifier so results never leave the bound repository.
pub(crate) fn scoped_query(query: &str, scope: &RepoScope) -> String {
    format!("{} repo:{}", query.trim(), scope.full_name())
}

fn per_page(requested: Option<u64>) -> String {
    requested.unwrap_or(MAX_RESULTS).clamp(1, MAX_RESULTS).to_string()
}

fn total_count(body: &Value) -> u64 {
    body.get("total_count").and_then(Value::as_u64).unwrap_or(0)
}

fn items(body: &Value) -> Result<&Vec<Value>, ToolError> {
    body.get("items")
        .ok_or_else(|| ToolError::MalformedResponse("missing 'items'".to_string()))
        .and_then(|items| array(items, "search results"))
}

/// Shapes a code search response.
pub(crate) fn code_search_output(body: &Value) -> Result<Value, ToolError> {
    let items = items(body)?
        .iter()
        .map(|item| {
            Ok(json!({
                "path": str_field(item, "path")?,
                "name": str_field(item, "name")?,
                "url": item.get("html_url").and_then(Value::as_str).unwrap_or_default(),
            }))
        })
        .collect::<Result<Vec<_>, ToolError>>()?;
    Ok(json!({"totalCount": total_count(body), "items": items}))
}

/// Shapes an issue search response.
pub(crate) fn issue_search_output(body: &Value) -> Result<Value, ToolError> {
    let items = items(body)?
        .iter()
        .map(|item| {
            Ok(json!({
                "number": item.get("number").and_then(Value::as_u64).unwrap_or(0),
                "title": str_field(item, "title")?,
                "state": str_field(item, "state")?,
                "isPullRequest": item.get("pull_request").is_some(),
                "url": item.get("html_url").and_then(Value::as_str).unwrap_or_default(),
            }))
        })
        .collect::<Result<Vec<_>, ToolError>>()?;
    Ok(json!({"totalCount": total_count(body), "items": items}))
}

fn require_query(args: &SearchArgs) -> Result<(), ToolError> {
    if args.query.trim().is_empty() {
        return Err(ToolError::InvalidArgs("query must not be empty".to_string()));
    }
    Ok(())
}

/// Searches code in the repository.
pub struct SearchCodeTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl SearchCodeTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "searchCode"
    }

    fn description(&self) -> &str {
        "Search for code in the repository using GitHub code search syntax. \
         Returns matching file paths."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search terms, e.g. 'fn parse language:rust'"
                },
                "perPage": {
                    "type": "integer",
                    "description": "Maximum number of results (1-30, default 30)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        require_query(&args)?;
        let q = scoped_query(&args.query, &self.scope);
        debug!(q = %q, "Searching code");
        let body = self
            .client
            .get_json(
                &["search", "code"],
                &[("q", q), ("per_page", per_page(args.per_page))],
            )
            .await?;
        code_search_output(&body)
    }
}

/// Searches issues and pull requests in the repository.
pub struct SearchIssuesTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl SearchIssuesTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for SearchIssuesTool {
    fn name(&self) -> &str {
        "searchIssuesAndPullRequests"
    }

    fn description(&self) -> &str {
        "Search issues and pull requests in the repository. \
         Optionally filter by state (open, closed, all)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search terms, e.g. 'memory leak label:bug'"
                },
                "state": {
                    "type": "string",
                    "enum": ["open", "closed", "all"],
                    "description": "Issue state filter (default: all)"
                },
                "perPage": {
                    "type": "integer",
                    "description": "Maximum number of results (1-30, default 30)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        require_query(&args)?;
        let mut q = scoped_query(&args.query, &self.scope);
        match args.state {
            Some(IssueState::Open) => q.push_str(" state:open"),
            Some(IssueState::Closed) => q.push_str(" state:closed"),
            Some(IssueState::All) | None => {}
        }
        debug!(q = %q, "Searching issues");
        let body = self
            .client
            .get_json(
                &["search", "issues"],
                &[("q", q), ("per_page", per_page(args.per_page))],
            )
            .await?;
        issue_search_output(&body)
    }
}
