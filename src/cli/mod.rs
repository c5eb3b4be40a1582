use crate::broker::BrokerState;
use crate::cache::CapabilityCache;
use crate::config::{Config, load_config};
use crate::events::{EventBus, TraceContext};
use crate::federation::Federation;
use crate::llm::invoker::Invoker;
use crate::mcp::RmcpConnector;
use crate::trace::TracerFanout;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "mcpweave", version, about = "Federated MCP agent runtime")]
pub struct Cli {
    /// Path to the base config file (default: ~/.mcpweave/config.json).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Optional overlay config; its keys win over the base file.
    #[arg(long, global = true)]
    pub overlay: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ask the agent one question.
    Ask {
        question: String,
        /// MCP servers to federate ("none" for a pure LLM run).
        #[arg(short, long, value_delimiter = ',', default_value = "none")]
        servers: Vec<String>,
        /// Stream content chunks to stdout as they arrive.
        #[arg(long)]
        stream: bool,
    },
    /// Run the code-exec broker HTTP API.
    Serve {
        /// MCP servers to federate for the broker.
        #[arg(short, long, value_delimiter = ',')]
        servers: Vec<String>,
    },
    /// Capability cache maintenance.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Show entry counts.
    Status,
    /// Remove expired entries.
    Cleanup,
    /// Wipe the cache.
    Clear,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.overlay.as_deref())?;

    match cli.command {
        Command::Ask {
            question,
            servers,
            stream,
        } => ask(config, &question, &servers, stream).await,
        Command::Serve { servers } => serve(config, &servers).await,
        Command::Cache { command } => cache_command(&config, command),
    }
}

fn build_federation(config: &Config, bus: Arc<EventBus>) -> Arc<Federation> {
    let cache = config
        .cache
        .enabled
        .then(|| CapabilityCache::global(&config.cache));
    Arc::new(Federation::new(
        config.mcp_servers.clone(),
        Arc::new(RmcpConnector),
        cache,
        bus,
    ))
}

async fn ask(mut config: Config, question: &str, servers: &[String], stream: bool) -> Result<()> {
    config.agent.streaming = config.agent.streaming || stream;

    let bus = Arc::new(EventBus::new());
    let tracers = TracerFanout::from_settings(&config.tracing, &bus);
    let federation = build_federation(&config, bus.clone());
    let invoker = Arc::new(
        Invoker::from_config(&config.fallback, &config.providers)?
            .with_llm_timeout(Duration::from_secs(config.agent.llm_timeout_secs)),
    );

    let trace = TraceContext::new();
    info!(trace_id = %trace.trace_id, "Starting agent session");

    let mut agent = crate::agent::Agent::new(
        federation,
        servers,
        invoker,
        bus.clone(),
        config.agent.clone(),
        trace,
    )
    .await?;

    // Ctrl-c cancels the in-flight conversation cooperatively.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_on_signal.cancel();
    });

    let result = agent.ask(question, &cancel).await;
    agent.shutdown().await;
    tracers.flush().await;
    tracers.shutdown().await;

    match result {
        Ok(answer) => {
            println!("{}", answer);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn serve(config: Config, servers: &[String]) -> Result<()> {
    let bus = Arc::new(EventBus::new());
    let tracers = TracerFanout::from_settings(&config.tracing, &bus);
    let federation = build_federation(&config, bus.clone());

    let trace = TraceContext::new();
    let view = federation.federate(servers, &trace).await?;
    info!(tools = view.tools.len(), "Broker federated view ready");

    let state = BrokerState::new(
        federation,
        view,
        bus,
        trace,
        config.broker.api_token.clone(),
        Duration::from_secs(config.agent.tool_timeout_secs),
    );
    let result = crate::broker::serve(state, &config.broker.host, config.broker.port).await;

    tracers.flush().await;
    tracers.shutdown().await;
    result
}

fn cache_command(config: &Config, command: CacheCommand) -> Result<()> {
    let cache = CapabilityCache::global(&config.cache);
    match command {
        CacheCommand::Status => {
            let (total, valid) = cache.stats();
            println!("cache entries: {} total, {} valid", total, valid);
        }
        CacheCommand::Cleanup => {
            let removed = cache.cleanup();
            println!("removed {} expired entries", removed);
        }
        CacheCommand::Clear => {
            cache.clear();
            println!("cache cleared");
        }
    }
    Ok(())
}
