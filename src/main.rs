use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forgeguard::config::Settings;
use forgeguard::control::BuildService;
use forgeguard::llm::{AnthropicClient, KeyPool, LlmClient, OpenAiClient};
use forgeguard::orchestrator::BuildRuntime;
use forgeguard::server;
use forgeguard::store::BuildStore;

#[derive(Parser)]
#[command(name = "forgeguard", about = "Governed build orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the build runtime and serving surface.
    Serve {
        /// Directory holding forgeguard.toml (defaults to cwd).
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config_dir } => serve(config_dir).await,
    }
}

async fn serve(config_dir: Option<PathBuf>) -> Result<()> {
    let dir = match config_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot resolve cwd")?,
    };
    let settings = Settings::load(&dir)?;

    std::fs::create_dir_all(&settings.workspace_root)
        .context("Failed to create workspace root")?;
    let store = Arc::new(BuildStore::open(&settings.database_path)?);
    let llm = provider_from_env()?;

    let runtime = BuildRuntime::new(settings.clone(), store, llm);
    runtime.startup_scan().await?;
    tokio::spawn(runtime.broadcaster.clone().run_heartbeat());

    let service = Arc::new(BuildService::new(runtime));
    let app = server::router(service);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "forgeguard listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Pick the provider family from whichever credentials are present. Each
/// family accepts a paired secondary key for round-robin.
fn provider_from_env() -> Result<Arc<dyn LlmClient>> {
    let http = reqwest::Client::new();
    let anthropic_keys: Vec<String> = ["ANTHROPIC_API_KEY", "ANTHROPIC_API_KEY_2"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .filter(|key| !key.is_empty())
        .collect();
    if !anthropic_keys.is_empty() {
        let pool = Arc::new(KeyPool::new(anthropic_keys));
        return Ok(Arc::new(AnthropicClient::new(http, pool)));
    }

    let openai_keys: Vec<String> = ["OPENAI_API_KEY", "OPENAI_API_KEY_2"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .filter(|key| !key.is_empty())
        .collect();
    if !openai_keys.is_empty() {
        let pool = Arc::new(KeyPool::new(openai_keys));
        return Ok(Arc::new(OpenAiClient::new(http, pool)));
    }

    anyhow::bail!("no provider credentials: set ANTHROPIC_API_KEY or OPENAI_API_KEY")
}
