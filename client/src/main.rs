//! `tillsync` - operator CLI for a device's local store.
//!
//! Configuration comes from `TILLSYNC_*` environment variables (a `.env`
//! file is honoured). Every command prints its outcome as JSON.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tillsync_client::{HttpRemote, OperationOutcome, SyncConfig, SyncOrchestrator};
use tillsync_engine::{EntityType, Resolution, Schema, Side};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Sync a till's offline store with the remote service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push, pull and reconcile once
    Sync,
    /// Push pending changes only
    Push,
    /// Pull remote changes only
    Pull,
    /// Discard local changes and reload everything from the remote
    Reset {
        /// Required; local edits that were never pushed are lost
        #[arg(long)]
        yes: bool,
    },
    /// Show queue and conflict counters
    Status,
    /// List pending changes
    Pending,
    /// Pull, then list conflicts grouped by entity type
    Conflicts,
    /// Pull, then resolve the conflict on one record
    Resolve {
        entity_type: EntityType,
        id: String,
        /// Which side wins: `local` or `server`
        #[arg(long)]
        keep: Side,
    },
    /// Pull, resolve every conflict, then push
    ResolveAll {
        #[arg(long)]
        keep: Side,
    },
    /// Re-arm changes that were marked failed
    RetryFailed,
    /// Run background sync until interrupted
    Run,
}

#[derive(Serialize)]
struct Output<T: Serialize> {
    command: &'static str,
    #[serde(flatten)]
    body: T,
}

fn print<T: Serialize>(command: &'static str, body: T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&Output { command, body })?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    let remote = Arc::new(HttpRemote::from_config(&config)?);
    let sync = SyncOrchestrator::open(config, Schema::business_default(), remote)?;

    match cli.command {
        Command::Sync => print("sync", sync.manual_sync().await)?,
        Command::Push => print("push", sync.push_changes().await)?,
        Command::Pull => print("pull", sync.pull_changes().await)?,
        Command::Reset { yes } => {
            if !yes {
                return Err("reset discards unpushed changes; pass --yes to confirm".into());
            }
            print("reset", sync.reset_and_resync().await)?
        }
        Command::Status => print("status", sync.status().snapshot())?,
        Command::Pending => print("pending", serde_json::json!({ "changes": sync.pending_changes() }))?,
        Command::Conflicts => {
            let pulled = sync.pull_changes().await;
            let grouped: serde_json::Map<String, serde_json::Value> = sync
                .conflicts_by_type()
                .into_iter()
                .map(|(ty, list)| Ok((ty.to_string(), serde_json::to_value(list)?)))
                .collect::<Result<_, serde_json::Error>>()?;
            print("conflicts", serde_json::json!({ "pull": pulled, "conflicts": grouped }))?
        }
        Command::Resolve { entity_type, id, keep } => {
            sync.pull_changes().await;
            let outcome = match sync
                .conflicts()
                .into_iter()
                .find(|c| c.entity_type == entity_type && c.entity_id == id)
            {
                Some(conflict) => sync.resolve(&conflict.id, Resolution::from(keep)),
                None => OperationOutcome::failed(format!("no conflict on {entity_type} {id}")),
            };
            print("resolve", outcome)?
        }
        Command::ResolveAll { keep } => {
            sync.pull_changes().await;
            let resolved = sync.resolve_all(keep);
            let pushed = sync.push_changes().await;
            print("resolve-all", serde_json::json!({ "resolved": resolved, "push": pushed }))?
        }
        Command::RetryFailed => print("retry-failed", sync.retry_failed())?,
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let task = sync.spawn(shutdown_rx);
            tracing::info!("background sync running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            task.await?;
            print("run", sync.status().snapshot())?
        }
    }

    Ok(())
}
