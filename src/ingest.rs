//! Pulls new/updated observations from the iNaturalist feed and persists
//! them, advancing a checkpoint cursor so the next run only asks for what
//! changed since the last one.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::db::Db;
use crate::inat_client::{InatClient, ListObservationsParams};
use crate::mapper::map_observation;

const STATE_KEY_LAST_UPDATED_SINCE: &str = "inat.last_updated_since";

pub struct IngestConfig {
    pub taxon_id: i64,
    pub place_id: i64,
    pub quality_grade: String,
    pub per_page: i64,
    pub backfill_days: i64,
    pub overlap_hours: i64,
    pub max_pages_per_run: i64,
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub observations: u64,
    pub photos: u64,
}

fn format_cursor(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn parse_cursor(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Runs a single ingestion pass: pages through the feed from the last
/// checkpoint (widened by `overlap_hours` for clock-skew tolerance) until a
/// page comes back empty or `max_pages_per_run` is hit, upserting every
/// observation and photo as it goes. The cursor only advances past
/// observations actually persisted this run.
pub async fn ingest(db: &Db, client: &InatClient, cfg: &IngestConfig) -> eyre::Result<IngestOutcome> {
    db.ensure_schema().await?;

    let last_updated_since = db.get_state(STATE_KEY_LAST_UPDATED_SINCE).await?;
    let last_dt = parse_cursor(last_updated_since.as_deref())
        .unwrap_or_else(|| Utc::now() - ChronoDuration::days(cfg.backfill_days));

    let updated_since = format_cursor(last_dt - ChronoDuration::hours(cfg.overlap_hours));

    let mut page = 1i64;
    let mut max_updated_at: Option<DateTime<Utc>> = None;
    let mut outcome = IngestOutcome::default();

    loop {
        if cfg.max_pages_per_run > 0 && page > cfg.max_pages_per_run {
            break;
        }

        let params = ListObservationsParams {
            taxon_id: cfg.taxon_id,
            place_id: cfg.place_id,
            quality_grade: &cfg.quality_grade,
            per_page: cfg.per_page,
            page,
            updated_since: Some(updated_since.as_str()),
            order_by: "updated_at",
            order: "asc",
        };
        let data = client.list_observations(&params).await?;

        let results = data.get("results").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        if results.is_empty() {
            break;
        }

        // One transaction per page: all of its observations and photos land
        // together, with no network I/O in between. A failure partway
        // through rolls the whole page back so the next run retries it
        // cleanly instead of resuming mid-page.
        let mut tx = db.begin().await?;

        for raw in &results {
            let Some(mapped) = map_observation(raw) else {
                warn!("skipping observation with no numeric id");
                continue;
            };

            Db::upsert_observation(&mut *tx, &mapped.observation).await?;
            outcome.observations += 1;

            for photo in &mapped.photos {
                Db::upsert_photo(&mut *tx, photo).await?;
                outcome.photos += 1;
            }

            if let Some(updated_at) = mapped.updated_at {
                let is_newer = match max_updated_at {
                    Some(current) => updated_at > current,
                    None => true,
                };
                if is_newer {
                    max_updated_at = Some(updated_at);
                }
            }
        }

        tx.commit().await?;
        page += 1;
    }

    if let Some(max_updated_at) = max_updated_at {
        db.set_state_committed(STATE_KEY_LAST_UPDATED_SINCE, &format_cursor(max_updated_at)).await?;
    }

    info!(
        observations = outcome.observations,
        photos = outcome.photos,
        pages = page - 1,
        "ingestion pass complete"
    );

    Ok(outcome)
}
