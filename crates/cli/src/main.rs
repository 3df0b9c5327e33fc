//! CLI entrypoint and subcommand orchestration.

mod config;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use agent::{
    Conversation, ConversationConfig, LlmProvider, OpenAiProvider, ToolRegistry,
    spawn_conversation,
};
use clap::{Parser, Subcommand};
use config::Config;
use gateway::{ConversationFactory, WebServer};
use tools::{GitHubClient, RepoScope};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments.
#[derive(Parser)]
#[command(name = "repochat")]
#[command(about = "Chat with an LLM about a GitHub repository", version)]
struct Cli {
    /// Path to config file (default: ~/.repochat/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write debug logs to ~/.repochat/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat about one repository
    Chat {
        /// Repository as `owner/repo`
        repo: String,
    },

    /// Serve the WebSocket gateway
    Serve {
        /// Port override (default: `web.port` from config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Chat { .. } => "chat",
            Commands::Serve { .. } => "serve",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Held until exit so buffered file writes are flushed.
    let _file_guard = init_logging(&cli.log_level, cli.debug);

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cli.command.label(),
            log_level = %cli.log_level,
            "========== repochat session start =========="
        );
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat { repo } => cmd_chat(config, &repo).await,
        Commands::Serve { port } => cmd_serve(config, port).await,
    }
}

/// Console logging filtered by `RUST_LOG` or `--log-level`; with `debug`, a
/// second layer writes everything at debug level to a daily rolling file.
fn init_logging(
    log_level: &str,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if !debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = PathBuf::from(home).join(".repochat").join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_target(false).with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new(
            "debug,hyper_util=info,rustls=info,reqwest=info,h2=info",
        ));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

/// Builds a conversation per repository from one shared provider and GitHub client.
struct RepoConversationFactory {
    llm: Arc<dyn LlmProvider>,
    github: Arc<GitHubClient>,
    conversation: ConversationConfig,
}

impl RepoConversationFactory {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        if config.agent.api_key.is_empty() {
            warn!("No API key configured. Set OPENAI_API_KEY or agent.api_key.");
        }
        if config.github.token().is_none() {
            warn!("No GitHub token configured; requests are unauthenticated and rate limited.");
        }

        let llm: Arc<dyn LlmProvider> = match config.agent.effective_base_url() {
            Some(base_url) => Arc::new(OpenAiProvider::with_base_url(
                &config.agent.api_key,
                base_url,
            )),
            None => Arc::new(OpenAiProvider::new(&config.agent.api_key)),
        };
        let github = GitHubClient::with_config(
            &config.github.api_base,
            config.github.token(),
            config.github.timeout_secs,
        )?;

        let mut conversation = ConversationConfig::new(config.agent.model.clone());
        conversation.max_rounds = config.agent.max_rounds;
        conversation.confirm_tools = config.agent.confirm_set();

        Ok(Self {
            llm,
            github: Arc::new(github),
            conversation,
        })
    }
}

impl ConversationFactory for RepoConversationFactory {
    fn create(&self, scope: RepoScope) -> Conversation {
        let registry =
            ToolRegistry::from_tools(tools::repository_tools(self.github.clone(), scope.clone()));
        Conversation::new(
            scope,
            self.llm.clone(),
            registry,
            self.conversation.clone(),
        )
    }
}

/// Interactive stdin chat bound to one repository.
async fn cmd_chat(config: Config, repo: &str) -> anyhow::Result<()> {
    let scope = RepoScope::parse(repo)
        .ok_or_else(|| anyhow::anyhow!("expected a repository as owner/repo, got '{repo}'"))?;
    let factory = RepoConversationFactory::from_config(&config)?;
    info!(repo = %scope, model = %config.agent.model, "Starting chat");

    let handle = spawn_conversation(factory.create(scope));
    repl::run(handle).await
}

/// Runs the WebSocket gateway until Ctrl-C.
async fn cmd_serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let factory = RepoConversationFactory::from_config(&config)?;
    let port = port.unwrap_or(config.web.port);
    if config.web.auth_token.is_empty() {
        warn!("web.auth_token is empty; WebSocket clients are not authenticated");
    }

    let server = WebServer::new(
        port,
        config.web.auth_token.clone(),
        config.web.cors_origins.clone(),
        Arc::new(factory),
    );
    server.run().await?;
    Ok(())
}
