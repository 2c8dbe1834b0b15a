use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use matchfeed_core::view::project_snapshot;
use matchfeed_core::{FilterSpec, StatusFilter};
use matchfeed_ingest::{ingest_snapshot, load_fixture_snapshot};
use matchfeed_sync::{load_presets, snapshot_once, FeedConfig, FeedRuntime};
use matchfeed_transport::HttpSnapshotClient;
use matchfeed_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchfeed")]
#[command(about = "Live match feed sync client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mount every configured subscription and log view changes.
    Watch,
    /// Fetch one snapshot and print the resulting views as JSON.
    Snapshot {
        #[arg(long, default_value = "all")]
        filter: StatusFilter,
        #[arg(long)]
        sport: Option<String>,
        #[arg(long = "q")]
        search: Option<String>,
        #[arg(long)]
        refresh_odds: bool,
        /// Read the snapshot body from a JSON file instead of the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Run the subscriptions behind the JSON web surface.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = FeedConfig::from_env();

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => watch(&config).await?,
        Commands::Snapshot {
            filter,
            sport,
            search,
            refresh_odds,
            fixture,
        } => {
            let spec = FilterSpec {
                status_filter: filter,
                sport_filter: sport,
                search_text: search,
                refresh_odds,
            };
            let views = match fixture {
                Some(path) => {
                    let body = load_fixture_snapshot(&path)?;
                    project_snapshot(ingest_snapshot(&body).into_entities(), &spec, Utc::now())
                }
                None => {
                    let client = HttpSnapshotClient::new(config.snapshot_client_config())?;
                    snapshot_once(&client, &spec, Utc::now()).await?
                }
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&views).context("rendering views")?
            );
        }
        Commands::Serve => {
            let presets = load_presets(&config.workspace_root)?;
            let runtime = FeedRuntime::start(&config, &presets).await?;
            let state = AppState::from_runtime(&runtime);
            let served = matchfeed_web::serve(state, config.web_port).await;
            runtime.shutdown().await?;
            served?;
        }
    }

    Ok(())
}

async fn watch(config: &FeedConfig) -> Result<()> {
    let presets = load_presets(&config.workspace_root)?;
    let runtime = FeedRuntime::start(config, &presets).await?;

    let watchers = runtime
        .views()
        .into_iter()
        .map(|(name, mut rx)| {
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let views = rx.borrow_and_update().clone();
                    let live = views
                        .iter()
                        .filter(|v| v.status_class == matchfeed_core::StatusClass::Live)
                        .count();
                    info!(subscription = %name, matches = views.len(), live, "view updated");
                }
            })
        })
        .collect::<Vec<_>>();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    runtime.shutdown().await?;
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}
