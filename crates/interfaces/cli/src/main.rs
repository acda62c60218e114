mod interactive;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ei_config::AppConfig;
use ei_llm::HttpTransport;
use ei_runtime::Processor;
use ei_storage::FsStorage;

#[derive(Debug, Parser)]
#[command(name = "ei", version, about = "A personal companion with a living memory")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the interactive session (the default).
    Start,
    /// Check configuration and transport reachability.
    Doctor,
    /// Delete all local state.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

/// `EI_DATA_PATH`, or the XDG data dir, or `./.ei` as a last resort.
fn data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("EI_DATA_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/ei");
    }
    PathBuf::from(".ei")
}

fn init_tracing() {
    let default = if std::env::var("EI_DEBUG").is_ok_and(|v| v == "1" || v == "true") {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let outcome = match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => run_start().await,
        Commands::Doctor => run_doctor().await,
        Commands::Reset { yes } => run_reset(yes),
    };

    if let Err(err) = outcome {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run_start() -> Result<()> {
    let root = data_dir();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create data dir {}", root.display()))?;
    let config = AppConfig::load_from(root.join("config.toml"))?;

    let transport = Arc::new(HttpTransport::new(config.clone()));
    let storage = Arc::new(FsStorage::new(&root));
    let processor = Arc::new(Processor::new(config, transport, storage));
    processor
        .start()
        .await
        .context("processor failed to start")?;

    interactive::run(processor).await
}

async fn run_doctor() -> Result<()> {
    let root = data_dir();
    println!("data dir:   {}", root.display());

    let config_path = root.join("config.toml");
    let config = AppConfig::load_from(&config_path)?;
    println!(
        "config:     {} ({})",
        config_path.display(),
        if config_path.exists() { "found" } else { "defaults" }
    );
    println!("llm base:   {}", config.llm.base_url);
    println!("model:      {}", config.llm.model);
    println!(
        "api key:    {}",
        if config.llm.api_key.is_empty() { "(none)" } else { "set" }
    );
    println!("ceremony:   {} {}", config.schedule.ceremony_time, config.schedule.timezone);
    Ok(())
}

fn run_reset(yes: bool) -> Result<()> {
    let root = data_dir();
    if !root.exists() {
        println!("nothing to reset at {}", root.display());
        return Ok(());
    }
    if !yes {
        bail!(
            "this deletes all state under {} — rerun with --yes to confirm",
            root.display()
        );
    }
    std::fs::remove_dir_all(&root)?;
    println!("removed {}", root.display());
    Ok(())
}
