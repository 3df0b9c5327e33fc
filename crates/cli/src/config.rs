use std::collections::HashSet;
use std::path::{Path, PathBuf};

use agent::DEFAULT_MAX_ROUNDS;
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tools::DEFAULT_API_BASE;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_GITHUB_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration, read from `~/.repochat/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Model and conversation loop settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// GitHub API access.
    #[serde(default)]
    pub github: GithubConfig,

    /// WebSocket gateway.
    #[serde(default)]
    pub web: WebConfig,
}

/// Model/provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// API key (`OPENAI_API_KEY` overrides at load time).
    #[serde(default)]
    pub api_key: String,
    /// OpenAI-compatible API base. `None` uses the public OpenAI endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model calls allowed per logical turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Tools that wait for a y/n decision before running.
    #[serde(default)]
    pub confirm_tools: Vec<String>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: String::new(),
            base_url: None,
            max_rounds: default_max_rounds(),
            confirm_tools: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Base URL with blank values treated as unset.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn confirm_set(&self) -> HashSet<String> {
        self.confirm_tools
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// GitHub REST API config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Personal access token. Empty = unauthenticated (60 req/h).
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_GITHUB_TIMEOUT_SECS
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GithubConfig {
    pub fn token(&self) -> Option<String> {
        let token = self.token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

/// WebSocket gateway config.
///
/// `REPOCHAT_WEB_TOKEN` overrides `auth_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Token clients pass as `?token=`. Empty = no auth.
    #[serde(default)]
    pub auth_token: String,
    /// Allowed CORS origins (comma-separated), `*` for any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

fn default_web_port() -> u16 {
    3210
}

fn default_cors_origins() -> String {
    "*".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            auth_token: String::new(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Config {
    /// `~/.repochat/config.toml`, if `HOME` is set.
    pub fn default_path() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".repochat").join("config.toml"))
    }

    /// Loads the file (explicit path or the default), then applies env overrides
    /// and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Config::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        debug!(
            model = %config.agent.model,
            base_url = ?config.agent.effective_base_url(),
            max_rounds = config.agent.max_rounds,
            github_api = %config.github.api_base,
            "Config loaded"
        );
        Ok(config)
    }

    /// Parses one TOML file without env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Reading config file");
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Environment variables win over the file. Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("OPENAI_API_KEY") {
            self.agent.api_key = key;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.agent.base_url = Some(url);
        }
        if let Some(model) = var("REPOCHAT_MODEL") {
            self.agent.model = model;
        }
        if let Some(token) = var("GITHUB_TOKEN") {
            self.github.token = token;
        }
        if let Some(token) = var("REPOCHAT_WEB_TOKEN") {
            self.web.auth_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.model.trim().is_empty() {
            return Err(ConfigError::MissingField("agent.model".to_string()));
        }
        if self.agent.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_rounds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.github.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "github.timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
