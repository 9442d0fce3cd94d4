use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single iNaturalist observation, mapped from the feed's JSON shape into
/// the columns `ensure_schema` creates for `observations`.
#[derive(Debug, Clone)]
pub struct ObservationRecord {
    pub observation_id: i64,
    pub inat_url: String,
    pub taxon_id: Option<i64>,
    pub taxon_name: Option<String>,
    pub taxon_preferred_common_name: Option<String>,
    pub quality_grade: Option<String>,
    pub captive: Option<bool>,
    pub license_code: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub observed_on: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub positional_accuracy: Option<i64>,
    pub place_guess: Option<String>,
    pub user_id: Option<i64>,
    pub user_login: Option<String>,
    pub description: Option<String>,
    pub raw: Value,
}

/// One of an observation's photos, mapped from the feed's `photos[]` entries.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub photo_id: i64,
    pub observation_id: i64,
    pub position: i32,
    pub url_square: Option<String>,
    pub url_large: Option<String>,
    pub url_original: Option<String>,
    pub license_code: Option<String>,
    pub attribution: Option<String>,
    pub raw: Value,
}

/// Result of mapping one feed observation: the observation row plus its photos.
#[derive(Debug, Clone)]
pub struct MappedObservation {
    pub observation: ObservationRecord,
    pub photos: Vec<PhotoRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a single `(photo, model_provider, model, prompt_version)`
/// classification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationStatus {
    Pending,
    Succeeded,
    Failed,
    PermanentFailed,
}

impl ClassificationStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ClassificationStatus::Pending => "pending",
            ClassificationStatus::Succeeded => "succeeded",
            ClassificationStatus::Failed => "failed",
            ClassificationStatus::PermanentFailed => "permanent_failed",
        }
    }
}

/// A photo selected for classification, with everything a worker needs to
/// call the gateway without touching the database.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub photo_id: i64,
    pub observation_id: i64,
    pub image_url: String,
    pub notes: String,
    pub attempt_count: i32,
}
