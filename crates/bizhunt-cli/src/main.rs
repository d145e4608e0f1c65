use anyhow::{bail, Context, Result};
use bizhunt_core::RunStatus;
use bizhunt_storage::PgListingStore;
use bizhunt_sync::{RunRequest, SourceSelection, SyncConfig};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bizhunt")]
#[command(about = "Business-for-sale listing ingester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the selected sources once and print the run report as JSON.
    Scrape {
        /// Source ids to run, or `all`.
        #[arg(long, num_args = 1.., value_name = "SOURCE")]
        sources: Vec<String>,
        /// Stop enumerating each source after this many listing URLs.
        #[arg(long)]
        max_listings: Option<usize>,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Serve the HTTP trigger API.
    Serve,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    // stdout carries the JSON report, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// First Ctrl-C cancels the token; in-flight merges finish and the run is still recorded.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape {
        sources: Vec::new(),
        max_listings: None,
    }) {
        Commands::Scrape {
            sources,
            max_listings,
        } => {
            let request = RunRequest {
                sources: SourceSelection::from_names(sources),
                max_listings_per_source: max_listings,
            };
            let summary = bizhunt_sync::run_once_from_env(&request, cancel_on_ctrl_c()).await?;
            println!("{}", serde_json::to_string_pretty(&summary.run)?);
            if let Some(dir) = &summary.reports_dir {
                info!(reports = %dir, "run reports written");
            }
            if summary.run.status == RunStatus::Error {
                bail!("run {} ended with status error", summary.run.run_id);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; the file store needs no migrations");
            };
            let store = PgListingStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
        }
        Commands::Serve => {
            bizhunt_web::serve_from_env(cancel_on_ctrl_c()).await?;
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let store = bizhunt_sync::open_store(&config).await?;
            let markdown = bizhunt_sync::report_recent_runs_markdown(store.as_ref(), runs).await?;
            println!("{markdown}");
        }
    }

    Ok(())
}
