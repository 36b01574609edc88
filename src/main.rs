use clap::{Parser, Subcommand};
use investigation_state::config::StateConfig;
use investigation_state::error::Result;
use investigation_state::runtime::StateServices;
use investigation_state::store::{Deadline, FileStateStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "investigation-state",
    about = "Operator tool for investigation session state"
)]
struct Cli {
    /// YAML config file; environment variables are used when omitted
    #[arg(long, env = "INVESTIGATION_STATE_CONFIG")]
    config: Option<String>,

    /// JSON file backing the state store
    #[arg(
        long,
        env = "INVESTIGATION_STATE_STORE",
        default_value = "~/.investigation-state/state.json"
    )]
    store: PathBuf,

    /// Deadline for a single command, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    deadline_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the cleanup scheduler until Ctrl-C
    Run,
    /// Run a single cleanup pass and print the report
    Sweep,
    /// Resume the session bound to a client, or create one
    Resume {
        #[arg(long)]
        user: String,
        #[arg(long)]
        client: Option<String>,
    },
    /// Print a stored investigation
    Show { session_id: String },
    /// Delete a session and its client index entry
    Close { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "investigation_state=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StateConfig::load(path)?,
        None => StateConfig::from_env()?,
    };
    let backend = Arc::new(FileStateStore::new(&cli.store)?);
    let services = StateServices::new(config, backend)?;
    let deadline = Deadline::after(Duration::from_millis(cli.deadline_ms));

    let outcome = run_command(&services, cli.command, deadline).await;
    services.shutdown().await?;
    outcome
}

async fn run_command(services: &StateServices, command: Command, deadline: Deadline) -> Result<()> {
    match command {
        Command::Run => {
            services.start_cleanup().await;
            info!("按 Ctrl-C 停止");
            tokio::signal::ctrl_c().await?;
            info!("收到停止信号");
        }
        Command::Sweep => {
            let report = services.cleanup().run_once(&CancellationToken::new()).await;
            print_json(&report)?;
        }
        Command::Resume { user, client } => {
            let outcome = services
                .lifecycle()
                .create_or_resume(&user, client.as_deref(), deadline)
                .await?;
            print_json(&json!({
                "session_id": outcome.session_id,
                "resumed": outcome.resumed,
                "phase": outcome.investigation.state.phase(),
            }))?;
        }
        Command::Show { session_id } => {
            let investigation = services.lifecycle().load(&session_id, deadline).await?;
            let ttl = services
                .store()
                .ttl(&investigation_state::store::state_key(&session_id), deadline)
                .await?;
            print_json(&json!({
                "ttl_seconds": ttl.map(|t| t.as_secs()),
                "memory_tokens": investigation.state.memory.token_estimate(),
                "investigation": investigation,
            }))?;
        }
        Command::Close { session_id } => {
            let existed = services.lifecycle().close(&session_id, deadline).await?;
            print_json(&json!({ "session_id": session_id, "closed": existed }))?;
        }
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
