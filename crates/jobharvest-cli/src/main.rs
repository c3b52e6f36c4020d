use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobharvest_storage::{JobQuery, JobStore};
use jobharvest_sync::{HarvestConfig, DEFAULT_DATABASE_URL};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobharvest")]
#[command(about = "Job listing harvester: discover, fetch, enrich and store postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest (default).
    Harvest,
    /// Create tables and unique indexes.
    Migrate,
    /// Serve the read API.
    Serve {
        #[arg(long, env = "JOBHARVEST_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Print stored postings as JSON lines.
    Jobs {
        #[arg(long)]
        q: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        seniority: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => {
            let summary = jobharvest_sync::run_harvest_from_env(shutdown_signal()).await?;
            println!(
                "harvest complete: run_id={} discovered={} fetched={} failed={} skipped={} persisted={} (inserted={} updated={}) interrupted={} total_rows={} companies={}",
                summary.run_id,
                summary.discovered_postings,
                summary.fetched,
                summary.fetch_failures,
                summary.skipped_existing,
                summary.persisted(),
                summary.inserted,
                summary.updated,
                summary.interrupted,
                summary.metrics.clean_rows,
                summary.metrics.distinct_companies,
            );
        }
        Commands::Migrate => {
            let store = open_store().await?;
            store.migrate().await.context("running migrations")?;
            println!("schema ready");
        }
        Commands::Serve { port } => {
            let store = open_store().await?;
            jobharvest_web::serve(store, port).await?;
        }
        Commands::Jobs {
            q,
            location,
            seniority,
            limit,
        } => {
            let store = open_store().await?;
            let rows = store
                .query(&JobQuery {
                    title: q,
                    location,
                    seniority,
                    limit,
                })
                .await
                .context("querying jobs")?;
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }

    Ok(())
}

async fn open_store() -> Result<JobStore> {
    let database_url = HarvestConfig::from_env().database_url;
    JobStore::connect(&database_url)
        .await
        .with_context(|| format!("opening database {database_url} (default {DEFAULT_DATABASE_URL})"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler unavailable; harvest runs uninterruptible");
        std::future::pending::<()>().await;
    }
}
