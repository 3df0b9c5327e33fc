//! GitHub REST client and repository scope shared by all repository tools.

use std::time::Duration;

use proto::ToolError;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Public GitHub REST API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("repochat/", env!("CARGO_PKG_VERSION"));

/// The repository a conversation is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoScope {
    pub owner: String,
    pub repo: String,
}

impl RepoScope {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parses `owner/repo`. Both halves must be non-empty.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, repo) = full_name.trim().split_once('/')?;
        let (owner, repo) = (owner.trim(), repo.trim().trim_end_matches(".git"));
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self::new(owner, repo))
    }

    /// `owner/repo`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Rewrites any `owner`/`repo` fields supplied by the model to this scope.
    pub fn override_input(&self, input: Value) -> Value {
        let mut object = match input {
            Value::Object(map) => map,
            other => return other,
        };
        for (key, bound) in [("owner", &self.owner), ("repo", &self.repo)] {
            if let Some(supplied) = object.get(key)
                && supplied.as_str() != Some(bound.as_str())
            {
                warn!(
                    key,
                    supplied = %supplied,
                    bound = %bound,
                    "Model addressed another repository; rebinding"
                );
                object.insert(key.to_string(), Value::String(bound.clone()));
            }
        }
        Value::Object(object)
    }

    /// Path segments of `/repos/{owner}/{repo}`.
    pub(crate) fn repo_segments(&self) -> Vec<&str> {
        vec!["repos", self.owner.as_str(), self.repo.as_str()]
    }
}

impl std::fmt::Display for RepoScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Thin GitHub REST client returning raw JSON.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl GitHubClient {
    /// Creates a client for the public API with the default timeout.
    pub fn new(token: Option<String>) -> Result<Self, ToolError> {
        Self::with_config(DEFAULT_API_BASE, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom API base (e.g. GitHub Enterprise) and timeout.
    pub fn with_config(
        api_base: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ToolError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid API base {api_base}: {e}")))?;
        if api_base.cannot_be_a_base() {
            return Err(ToolError::ExecutionFailed(format!(
                "invalid API base {api_base}"
            )));
        }
        let timeout = Duration::from_secs(timeout_secs);
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::ExecutionFailed(format!("HTTP client init failed: {e}")))?;
        Ok(Self {
            http,
            api_base,
            token: token.filter(|t| !t.trim().is_empty()),
            timeout,
        })
    }

    /// Builds the request URL from path segments (percent-encoded) and query pairs.
    pub(crate) fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments.iter().filter(|s| !s.is_empty()));
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Performs a GET and returns the JSON body.
    pub async fn get_json(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<Value, ToolError> {
        let url = self.url(segments, query);
        debug!(url = %url, "GitHub request");

        let mut request = self
            .http
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(self.timeout.as_secs())
            } else {
                ToolError::ExecutionFailed(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "GitHub error response");
            return Err(api_error(status, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::MalformedResponse(e.to_string()))
    }
}

/// Maps a non-success response to [`ToolError::Api`], preferring GitHub's `message` field.
fn api_error(status: StatusCode, body: &str) -> ToolError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    ToolError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Reads a string field, failing on schema drift.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::MalformedResponse(format!("missing string field '{key}'")))
}

/// Reads an array body, failing on schema drift.
pub(crate) fn array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>, ToolError> {
    value
        .as_array()
        .ok_or_else(|| ToolError::MalformedResponse(format!("expected an array of {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scope_accepts_owner_repo() {
        let scope = RepoScope::parse("tokio-rs/axum").expect("valid");
        assert_eq!(scope.owner, "tokio-rs");
        assert_eq!(scope.repo, "axum");
        assert_eq!(scope.full_name(), "tokio-rs/axum");
        assert_eq!(RepoScope::parse("tokio-rs/axum.git"), Some(scope));
    }

    #[test]
    fn parse_scope_rejects_incomplete_names() {
        assert_eq!(RepoScope::parse("axum"), None);
        assert_eq!(RepoScope::parse("/axum"), None);
        assert_eq!(RepoScope::parse("tokio-rs/"), None);
        assert_eq!(RepoScope::parse("a/b/c"), None);
    }

    #[test]
    fn override_input_rebinds_foreign_repository() {
        let scope = RepoScope::new("octo", "hello");
        let input = serde_json::json!({"owner": "evil", "repo": "other", "path": "src"});
        let bound = scope.override_input(input);
        assert_eq!(bound["owner"], "octo");
        assert_eq!(bound["repo"], "hello");
        assert_eq!(bound["path"], "src");
    }

    #[test]
    fn override_input_leaves_inputs_without_repo_fields() {
        let scope = RepoScope::new("octo", "hello");
        let input = serde_json::json!({"path": ""});
        assert_eq!(scope.override_input(input.clone()), input);
        assert_eq!(scope.override_input(Value::Null), Value::Null);
    }

    #[test]
    fn url_encodes_segments_and_query() {
        let client = GitHubClient::with_config("https://ghe.example.com/api/v3", None, 5)
            .expect("client");
        let url = client.url(
            &["repos", "octo", "hello", "contents", "docs", "my file.md"],
            &[("ref", "main".to_string())],
        );
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/repos/octo/hello/contents/docs/my%20file.md?ref=main"
        );
    }

    #[test]
    fn url_skips_empty_segments() {
        let client = GitHubClient::new(None).expect("client");
        let url = client.url(&["repos", "octo", "hello", "contents", ""], &[]);
        assert_eq!(url.as_str(), "https://api.github.com/repos/octo/hello/contents");
    }

    #[test]
    fn api_error_prefers_github_message() {
        let err = api_error(StatusCode::NOT_FOUND, r#"{"message":"Not Found"}"#);
        match err {
            ToolError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not Found");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = api_error(StatusCode::BAD_GATEWAY, "<html>");
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[test]
    fn invalid_api_base_is_rejected() {
        assert!(GitHubClient::with_config("not a url", None, 5).is_err());
    }
}
