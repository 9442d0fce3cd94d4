mod classify;
mod config;
mod db;
mod error;
mod inat_client;
mod ingest;
mod mapper;
mod models;
mod openrouter_client;
mod prompts;
mod stats;
mod supervisor;

use clap::{Parser, Subcommand};
use eyre::{eyre, Result};

use classify::{classify, ClassifyConfig};
use config::Settings;
use db::Db;
use inat_client::InatClient;
use ingest::{ingest, IngestConfig};

/// Ingests iNaturalist observations into Postgres and classifies their
/// photos via a vision-capable LLM gateway.
#[derive(Parser, Debug)]
#[command(name = "monarch-phenology", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema if it doesn't already exist.
    InitDb,
    /// Run one ingestion pass against the iNaturalist feed.
    Ingest,
    /// Run one classification pass over photos due for classification.
    Classify {
        #[arg(long, default_value_t = 25)]
        max_items: i64,
    },
    /// Run the supervisor loop until SIGINT/SIGTERM.
    Run,
    /// Print ingestion and classification counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    args.settings.validate()?;
    let settings = args.settings;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .init();

    let db = Db::connect(&settings.database_url).await?;

    match args.command {
        Command::InitDb => {
            db.ensure_schema().await?;
            println!("ok");
        }
        Command::Ingest => {
            let client = InatClient::new(
                settings.inat_sleep_seconds,
                settings.inat_max_retries as u32,
                settings.inat_retry_backoff_seconds,
            )?;
            let cfg = IngestConfig {
                taxon_id: settings.inat_taxon_id,
                place_id: settings.inat_place_id,
                quality_grade: settings.inat_quality_grade.clone(),
                per_page: settings.inat_per_page,
                backfill_days: settings.inat_backfill_days,
                overlap_hours: settings.inat_overlap_hours,
                max_pages_per_run: settings.inat_max_pages_per_run,
            };
            let outcome = ingest(&db, &client, &cfg).await?;
            println!("observations={} photos={}", outcome.observations, outcome.photos);
        }
        Command::Classify { max_items } => {
            let api_key = settings
                .openrouter_api_key
                .clone()
                .ok_or_else(|| eyre!("OPENROUTER_API_KEY is required to classify"))?;
            let model = settings
                .openrouter_model
                .clone()
                .ok_or_else(|| eyre!("OPENROUTER_MODEL is required to classify"))?;
            let prompt = prompts::load_prompt(&settings.prompt_path)?;
            let cfg = ClassifyConfig {
                api_key,
                model,
                prompt_version: settings.prompt_version.clone(),
                prompt,
                notes_max_chars: settings.classify_notes_max_chars,
                max_workers: settings.classify_max_workers as usize,
                max_attempts: settings.classify_max_attempts as i32,
                max_items,
                sleep_seconds: settings.classify_sleep_seconds,
            };
            let outcome = classify(&db, &cfg).await?;
            println!("succeeded={} failed={}", outcome.succeeded, outcome.failed);
        }
        Command::Run => {
            supervisor::run(&settings, &db).await?;
        }
        Command::Stats => {
            let stats = stats::collect(&db, &settings).await?;
            println!("{stats}");
        }
    }

    Ok(())
}
