//! Backing queries for the `stats` subcommand.

use chrono::{Duration, Utc};

use crate::classify::MODEL_PROVIDER;
use crate::config::Settings;
use crate::db::Db;
use crate::models::ClassificationStatus;

#[derive(Debug)]
pub struct Stats {
    pub observations: i64,
    pub photos: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub permanent_failed: i64,
    pub backlog: i64,
    pub succeeded_24h: i64,
    pub failed_24h: i64,
}

pub async fn collect(db: &Db, settings: &Settings) -> eyre::Result<Stats> {
    let model = settings.openrouter_model.as_deref().unwrap_or("");
    let prompt_version = &settings.prompt_version;
    let since = Utc::now() - Duration::hours(24);

    Ok(Stats {
        observations: db.count_observations().await?,
        photos: db.count_photos().await?,
        succeeded: db
            .count_classifications_by_status(MODEL_PROVIDER, model, prompt_version, ClassificationStatus::Succeeded)
            .await?,
        failed: db
            .count_classifications_by_status(MODEL_PROVIDER, model, prompt_version, ClassificationStatus::Failed)
            .await?,
        permanent_failed: db
            .count_classifications_by_status(MODEL_PROVIDER, model, prompt_version, ClassificationStatus::PermanentFailed)
            .await?,
        backlog: db.count_backlog(MODEL_PROVIDER, model, prompt_version).await?,
        succeeded_24h: db
            .count_recent_transitions(MODEL_PROVIDER, model, prompt_version, ClassificationStatus::Succeeded, since)
            .await?,
        failed_24h: db
            .count_recent_transitions(MODEL_PROVIDER, model, prompt_version, ClassificationStatus::Failed, since)
            .await?,
    })
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "observations={}", self.observations)?;
        writeln!(f, "photos={}", self.photos)?;
        writeln!(f, "succeeded={}", self.succeeded)?;
        writeln!(f, "failed={}", self.failed)?;
        writeln!(f, "permanent_failed={}", self.permanent_failed)?;
        writeln!(f, "backlog={}", self.backlog)?;
        writeln!(f, "succeeded_24h={}", self.succeeded_24h)?;
        write!(f, "failed_24h={}", self.failed_24h)
    }
}
