//! Repository contents tools: files, directories, and the README.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use proto::ToolError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::github::{GitHubClient, RepoScope, array, str_field};
use crate::{Tool, parse_args, truncate_text};

const MAX_FILE_CHARS: usize = 100_000;

#[derive(Debug, Deserialize)]
struct FileArgs {
    path: String,
    #[serde(default, rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryArgs {
    #[serde(default)]
    path: String,
    #[serde(default, rename = "ref")]
    git_ref: Option<String>,
}

fn contents_segments<'a>(scope: &'a RepoScope, path: &'a str) -> Vec<&'a str> {
    let mut segments = scope.repo_segments();
    segments.push("contents");
    segments.extend(path.split('/').filter(|s| !s.is_empty()));
    segments
}

fn ref_query(git_ref: Option<String>) -> Vec<(&'static str, String)> {
    git_ref
        .filter(|r| !r.trim().is_empty())
        .map(|r| vec![("ref", r)])
        .unwrap_or_default()
}

/// Decodes the base64 `content` field of a contents-API file object.
pub(crate) fn decode_content(file: &Value) -> Result<String, ToolError> {
    if let Some(encoding) = file.get("encoding").and_then(Value::as_str)
        && encoding != "base64"
    {
        return Err(ToolError::MalformedResponse(format!(
            "unsupported content encoding '{encoding}'"
        )));
    }
    let raw = str_field(file, "content")?;
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| ToolError::MalformedResponse(format!("invalid base64 content: {e}")))?;
    if bytes.contains(&0) {
        return Err(ToolError::ExecutionFailed(
            "file appears to be binary and cannot be displayed".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Shapes a decoded file object into the tool output.
fn file_output(file: &Value) -> Result<Value, ToolError> {
    let path = str_field(file, "path")?;
    let content = decode_content(file)?;
    let (content, truncated) = truncate_text(&content, MAX_FILE_CHARS);
    Ok(json!({
        "path": path,
        "size": file.get("size").and_then(Value::as_u64).unwrap_or(0),
        "content": content,
        "truncated": truncated,
    }))
}

/// Shapes a directory listing into `{name, path, type, size}` entries.
pub(crate) fn directory_output(listing: &Value) -> Result<Value, ToolError> {
    let entries = array(listing, "directory entries")?
        .iter()
        .map(|entry| {
            Ok(json!({
                "name": str_field(entry, "name")?,
                "path": str_field(entry, "path")?,
                "type": str_field(entry, "type")?,
                "size": entry.get("size").and_then(Value::as_u64).unwrap_or(0),
            }))
        })
        .collect::<Result<Vec<_>, ToolError>>()?;
    Ok(Value::Array(entries))
}

/// Fetches a single file.
pub struct GetFileContentsTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl GetFileContentsTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for GetFileContentsTool {
    fn name(&self) -> &str {
        "getFileContents"
    }

    fn description(&self) -> &str {
        "Fetch the text content of a single file in the repository. \
         Large files are truncated to 100,000 characters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the repository root, e.g. src/main.rs"
                },
                "ref": {
                    "type": "string",
                    "description": "Branch, tag, or commit SHA (default: the default branch)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: FileArgs = parse_args(args)?;
        if args.path.trim().is_empty() {
            return Err(ToolError::InvalidArgs("path must not be empty".to_string()));
        }
        debug!(repo = %self.scope, path = %args.path, "Fetching file");
        let body = self
            .client
            .get_json(
                &contents_segments(&self.scope, &args.path),
                &ref_query(args.git_ref),
            )
            .await?;
        if body.is_array() {
            return Err(ToolError::InvalidArgs(format!(
                "'{}' is a directory; use listDirectoryContents instead",
                args.path
            )));
        }
        file_output(&body)
    }
}

/// Lists a directory (the repository root by default).
pub struct ListDirectoryContentsTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl ListDirectoryContentsTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for ListDirectoryContentsTool {
    fn name(&self) -> &str {
        "listDirectoryContents"
    }

    fn description(&self) -> &str {
        "List files and subdirectories at a path in the repository. \
         Use an empty path for the repository root."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the repository root (empty for root)"
                },
                "ref": {
                    "type": "string",
                    "description": "Branch, tag, or commit SHA (default: the default branch)"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: DirectoryArgs = parse_args(args)?;
        debug!(repo = %self.scope, path = %args.path, "Listing directory");
        let body = self
            .client
            .get_json(
                &contents_segments(&self.scope, &args.path),
                &ref_query(args.git_ref),
            )
            .await?;
        if body.is_object() {
            return Err(ToolError::InvalidArgs(format!(
                "'{}' is a file; use getFileContents instead",
                args.path
            )));
        }
        directory_output(&body)
    }
}

/// Fetches the repository README.
pub struct GetReadmeTool {
    client: Arc<GitHubClient>,
    scope: RepoScope,
}

impl GetReadmeTool {
    pub fn new(client: Arc<GitHubClient>, scope: RepoScope) -> Self {
        Self { client, scope }
    }
}

#[async_trait]
impl Tool for GetReadmeTool {
    fn name(&self) -> &str {
        "getReadme"
    }

    fn description(&self) -> &str {
        "Fetch the repository README. A good first step to learn what the project does."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let mut segments = self.scope.repo_segments();
        segments.push("readme");
        let body = self.client.get_json(&segments, &[]).await?;
        file_output(&body)
    }
}
