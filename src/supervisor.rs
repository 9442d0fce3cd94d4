//! Long-running `run` mode: two independently-paced timers drive ingestion
//! and classification until the process receives a shutdown signal.

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::classify::{classify, ClassifyConfig};
use crate::config::Settings;
use crate::db::Db;
use crate::ingest::{ingest, IngestConfig};
use crate::inat_client::InatClient;

/// The original continuous-loop default batch size per classify tick,
/// distinct from the `classify` subcommand's own `--max-items` default.
const SUPERVISOR_CLASSIFY_BATCH: i64 = 5;

pub async fn run(settings: &Settings, db: &Db) -> eyre::Result<()> {
    let inat_client = InatClient::new(
        settings.inat_sleep_seconds,
        settings.inat_max_retries as u32,
        settings.inat_retry_backoff_seconds,
    )?;

    let mut ingest_interval = tokio::time::interval(settings.ingest_interval());
    let mut classify_interval = tokio::time::interval(settings.classify_interval());
    let mut sigterm = signal(SignalKind::terminate())?;

    info!(
        ingest_every_seconds = settings.ingest_interval().as_secs(),
        classify_every_seconds = settings.classify_interval().as_secs(),
        "supervisor starting"
    );

    loop {
        tokio::select! {
            _ = ingest_interval.tick() => {
                let cfg = IngestConfig {
                    taxon_id: settings.inat_taxon_id,
                    place_id: settings.inat_place_id,
                    quality_grade: settings.inat_quality_grade.clone(),
                    per_page: settings.inat_per_page,
                    backfill_days: settings.inat_backfill_days,
                    overlap_hours: settings.inat_overlap_hours,
                    max_pages_per_run: settings.inat_max_pages_per_run,
                };
                match ingest(db, &inat_client, &cfg).await {
                    Ok(outcome) => info!(observations = outcome.observations, photos = outcome.photos, "ingest tick complete"),
                    Err(err) => error!(error = %err, "ingest tick failed"),
                }
            }
            _ = classify_interval.tick() => {
                if let (Some(api_key), Some(model)) = (&settings.openrouter_api_key, &settings.openrouter_model) {
                    match run_classify_tick(settings, db, api_key, model).await {
                        Ok(outcome) => info!(succeeded = outcome.succeeded, failed = outcome.failed, "classify tick complete"),
                        Err(err) => error!(error = %err, "classify tick failed"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down after current tick");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down after current tick");
                break;
            }
        }
    }

    Ok(())
}

async fn run_classify_tick(
    settings: &Settings,
    db: &Db,
    api_key: &str,
    model: &str,
) -> eyre::Result<crate::classify::ClassifyOutcome> {
    let prompt = crate::prompts::load_prompt(&settings.prompt_path)?;
    let cfg = ClassifyConfig {
        api_key: api_key.to_string(),
        model: model.to_string(),
        prompt_version: settings.prompt_version.clone(),
        prompt,
        notes_max_chars: settings.classify_notes_max_chars,
        max_workers: settings.classify_max_workers as usize,
        max_attempts: settings.classify_max_attempts as i32,
        max_items: SUPERVISOR_CLASSIFY_BATCH,
        sleep_seconds: settings.classify_sleep_seconds,
    };
    classify(db, &cfg).await
}
