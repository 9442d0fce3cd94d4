//! PostgreSQL persistence layer. Owns the schema, the ingest cursor, and
//! every read/write the ingestion and classification engines need.
//!
//! Only the controller task ever calls into this module during a
//! classification run — worker tasks talk to the gateway client and hand
//! their results back for the controller to commit.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Transaction};

use crate::models::{ClassificationStatus, ObservationRecord, PhotoRecord, WorkItem};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS observations (
      observation_id BIGINT PRIMARY KEY,
      inat_url TEXT,
      taxon_id BIGINT,
      taxon_name TEXT,
      taxon_preferred_common_name TEXT,
      quality_grade TEXT,
      captive BOOLEAN,
      license_code TEXT,
      observed_at TIMESTAMPTZ,
      observed_on DATE,
      created_at TIMESTAMPTZ,
      updated_at TIMESTAMPTZ,
      latitude DOUBLE PRECISION,
      longitude DOUBLE PRECISION,
      positional_accuracy INTEGER,
      place_guess TEXT,
      user_id BIGINT,
      user_login TEXT,
      description TEXT,
      first_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      raw JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS observations_updated_at_idx ON observations (updated_at)",
    "CREATE INDEX IF NOT EXISTS observations_last_seen_at_idx ON observations (last_seen_at)",
    "CREATE INDEX IF NOT EXISTS observations_observed_on_idx ON observations (observed_on)",
    "CREATE INDEX IF NOT EXISTS observations_place_guess_idx ON observations (place_guess)",
    r#"
    CREATE TABLE IF NOT EXISTS photos (
      photo_id BIGINT PRIMARY KEY,
      observation_id BIGINT NOT NULL REFERENCES observations(observation_id) ON DELETE CASCADE,
      position INTEGER,
      url_square TEXT,
      url_large TEXT,
      url_original TEXT,
      license_code TEXT,
      attribution TEXT,
      first_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      raw JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS photos_observation_id_idx ON photos (observation_id)",
    "CREATE INDEX IF NOT EXISTS photos_last_seen_at_idx ON photos (last_seen_at)",
    r#"
    CREATE TABLE IF NOT EXISTS classifications (
      classification_id BIGSERIAL PRIMARY KEY,
      photo_id BIGINT NOT NULL REFERENCES photos(photo_id) ON DELETE CASCADE,
      observation_id BIGINT NOT NULL REFERENCES observations(observation_id) ON DELETE CASCADE,
      model_provider TEXT NOT NULL DEFAULT 'openrouter',
      model TEXT NOT NULL,
      prompt_version TEXT NOT NULL,
      prompt_hash TEXT,
      status TEXT NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      last_attempt_at TIMESTAMPTZ,
      attempt_count INTEGER NOT NULL DEFAULT 0,
      retry_after TIMESTAMPTZ,
      input_image_url TEXT,
      input_notes TEXT,
      input_notes_truncated BOOLEAN NOT NULL DEFAULT FALSE,
      output JSONB,
      raw_response JSONB,
      error TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS classifications_unique_config_idx
    ON classifications (photo_id, model_provider, model, prompt_version)
    "#,
    "CREATE INDEX IF NOT EXISTS classifications_status_idx ON classifications (status)",
    "CREATE INDEX IF NOT EXISTS classifications_retry_after_idx ON classifications (retry_after)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
      key TEXT PRIMARY KEY,
      value TEXT,
      updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

#[derive(FromRow)]
struct WorkRow {
    photo_id: i64,
    observation_id: i64,
    image_url: String,
    notes: Option<String>,
    attempt_count: i32,
}

impl Db {
    pub async fn connect(database_url: &str) -> eyre::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> eyre::Result<()> {
        for stmt in SCHEMA_STATEMENTS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Opens one transaction. Callers commit it themselves once all the
    /// writes for a unit of work (one ingest page, one reservation batch)
    /// have been issued, so each unit lands in a single commit instead of
    /// one per statement.
    pub async fn begin(&self) -> eyre::Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn get_state(&self, key: &str) -> eyre::Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .flatten();
        Ok(value)
    }

    /// Writes `key` directly against the pool, as its own single-statement
    /// commit. Used for the cursor write at the end of an ingest run, which
    /// stands outside any one page's transaction.
    pub async fn set_state_committed(&self, key: &str, value: &str) -> eyre::Result<()> {
        Self::set_state(&self.pool, key, value).await
    }

    pub async fn set_state<'e, E>(executor: E, key: &str, value: &str) -> eyre::Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO sync_state (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn upsert_observation<'e, E>(executor: E, o: &ObservationRecord) -> eyre::Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO observations (
              observation_id, inat_url, taxon_id, taxon_name, taxon_preferred_common_name,
              quality_grade, captive, license_code,
              observed_at, observed_on, created_at, updated_at,
              latitude, longitude, positional_accuracy, place_guess,
              user_id, user_login, description,
              first_seen_at, last_seen_at,
              raw
            )
            VALUES (
              $1, $2, $3, $4, $5,
              $6, $7, $8,
              $9, $10::date, $11, $12,
              $13, $14, $15, $16,
              $17, $18, $19,
              now(), now(),
              $20
            )
            ON CONFLICT (observation_id) DO UPDATE SET
              inat_url = EXCLUDED.inat_url,
              taxon_id = EXCLUDED.taxon_id,
              taxon_name = EXCLUDED.taxon_name,
              taxon_preferred_common_name = EXCLUDED.taxon_preferred_common_name,
              quality_grade = EXCLUDED.quality_grade,
              captive = EXCLUDED.captive,
              license_code = EXCLUDED.license_code,
              observed_at = EXCLUDED.observed_at,
              observed_on = EXCLUDED.observed_on,
              created_at = EXCLUDED.created_at,
              updated_at = EXCLUDED.updated_at,
              latitude = EXCLUDED.latitude,
              longitude = EXCLUDED.longitude,
              positional_accuracy = EXCLUDED.positional_accuracy,
              place_guess = EXCLUDED.place_guess,
              user_id = EXCLUDED.user_id,
              user_login = EXCLUDED.user_login,
              description = EXCLUDED.description,
              last_seen_at = now(),
              raw = EXCLUDED.raw
            "#,
        )
        .bind(o.observation_id)
        .bind(&o.inat_url)
        .bind(o.taxon_id)
        .bind(&o.taxon_name)
        .bind(&o.taxon_preferred_common_name)
        .bind(&o.quality_grade)
        .bind(o.captive)
        .bind(&o.license_code)
        .bind(o.observed_at)
        .bind(&o.observed_on)
        .bind(o.created_at)
        .bind(o.updated_at)
        .bind(o.latitude)
        .bind(o.longitude)
        .bind(o.positional_accuracy)
        .bind(&o.place_guess)
        .bind(o.user_id)
        .bind(&o.user_login)
        .bind(&o.description)
        .bind(&o.raw)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn upsert_photo<'e, E>(executor: E, p: &PhotoRecord) -> eyre::Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO photos (
              photo_id, observation_id, position,
              url_square, url_large, url_original,
              license_code, attribution,
              first_seen_at, last_seen_at,
              raw
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now(), $9)
            ON CONFLICT (photo_id) DO UPDATE SET
              observation_id = EXCLUDED.observation_id,
              position = EXCLUDED.position,
              url_square = EXCLUDED.url_square,
              url_large = EXCLUDED.url_large,
              url_original = EXCLUDED.url_original,
              license_code = EXCLUDED.license_code,
              attribution = EXCLUDED.attribution,
              last_seen_at = now(),
              raw = EXCLUDED.raw
            "#,
        )
        .bind(p.photo_id)
        .bind(p.observation_id)
        .bind(p.position)
        .bind(&p.url_square)
        .bind(&p.url_large)
        .bind(&p.url_original)
        .bind(&p.license_code)
        .bind(&p.attribution)
        .bind(&p.raw)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Selects up to `limit` photos due for classification under the given
    /// `(model_provider, model, prompt_version)` triple: photos with no
    /// classification row yet, or ones whose last attempt failed and whose
    /// retry window has elapsed.
    pub async fn select_next_work(
        &self,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        limit: i64,
    ) -> eyre::Result<Vec<WorkItem>> {
        let rows: Vec<WorkRow> = sqlx::query_as(
            r#"
            SELECT
              p.photo_id,
              p.observation_id,
              COALESCE(p.url_large, p.url_square, p.url_original) AS image_url,
              o.description AS notes,
              COALESCE(c.attempt_count, 0) AS attempt_count
            FROM photos p
            JOIN observations o ON o.observation_id = p.observation_id
            LEFT JOIN classifications c
              ON c.photo_id = p.photo_id
             AND c.model_provider = $1
             AND c.model = $2
             AND c.prompt_version = $3
            WHERE COALESCE(p.url_large, p.url_square, p.url_original) IS NOT NULL
              AND (
                c.classification_id IS NULL
                OR (c.status = 'failed' AND (c.retry_after IS NULL OR c.retry_after <= now()))
              )
            ORDER BY p.photo_id ASC
            LIMIT $4
            "#,
        )
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| WorkItem {
                photo_id: r.photo_id,
                observation_id: r.observation_id,
                image_url: r.image_url,
                notes: r.notes.unwrap_or_default(),
                attempt_count: r.attempt_count,
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_pending<'e, E>(
        executor: E,
        item: &WorkItem,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        prompt_hash_value: &str,
        input_notes: &str,
        input_notes_truncated: bool,
    ) -> eyre::Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO classifications (
              photo_id, observation_id, model_provider, model, prompt_version, prompt_hash,
              status, input_image_url, input_notes, input_notes_truncated
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9)
            ON CONFLICT (photo_id, model_provider, model, prompt_version) DO UPDATE SET
              updated_at = now(),
              status = 'pending',
              prompt_hash = EXCLUDED.prompt_hash,
              input_image_url = EXCLUDED.input_image_url,
              input_notes = EXCLUDED.input_notes,
              input_notes_truncated = EXCLUDED.input_notes_truncated,
              error = NULL
            "#,
        )
        .bind(item.photo_id)
        .bind(item.observation_id)
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .bind(prompt_hash_value)
        .bind(&item.image_url)
        .bind(input_notes)
        .bind(input_notes_truncated)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn mark_succeeded(
        &self,
        item: &WorkItem,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        output: &Value,
        raw_response: &Value,
    ) -> eyre::Result<()> {
        sqlx::query(
            r#"
            UPDATE classifications
            SET status = 'succeeded',
                updated_at = now(),
                last_attempt_at = now(),
                attempt_count = attempt_count + 1,
                retry_after = NULL,
                output = $1,
                raw_response = $2,
                error = NULL
            WHERE photo_id = $3 AND model_provider = $4 AND model = $5 AND prompt_version = $6
            "#,
        )
        .bind(output)
        .bind(raw_response)
        .bind(item.photo_id)
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks one attempt as failed. `retry_after_seconds` schedules the next
    /// attempt; the row flips to `permanent_failed` (and the retry window
    /// clears) once `attempt_count + 1` reaches `max_attempts`.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_failed(
        &self,
        item: &WorkItem,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        error: &str,
        retry_after_seconds: i64,
        max_attempts: i32,
        raw_response: Option<&Value>,
    ) -> eyre::Result<()> {
        let retry_after = Utc::now() + chrono::Duration::seconds(retry_after_seconds);
        sqlx::query(
            r#"
            UPDATE classifications
            SET status = CASE WHEN attempt_count + 1 >= $1 THEN 'permanent_failed' ELSE 'failed' END,
                updated_at = now(),
                last_attempt_at = now(),
                attempt_count = attempt_count + 1,
                retry_after = CASE WHEN attempt_count + 1 >= $1 THEN NULL ELSE $2 END,
                raw_response = COALESCE($3, raw_response),
                error = $4
            WHERE photo_id = $5 AND model_provider = $6 AND model = $7 AND prompt_version = $8
            "#,
        )
        .bind(max_attempts)
        .bind(retry_after)
        .bind(raw_response)
        .bind(error)
        .bind(item.photo_id)
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_permanent_failed(
        &self,
        item: &WorkItem,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        error: &str,
        raw_response: Option<&Value>,
    ) -> eyre::Result<()> {
        sqlx::query(
            r#"
            UPDATE classifications
            SET status = 'permanent_failed',
                updated_at = now(),
                last_attempt_at = now(),
                attempt_count = attempt_count + 1,
                retry_after = NULL,
                raw_response = COALESCE($1, raw_response),
                error = $2
            WHERE photo_id = $3 AND model_provider = $4 AND model = $5 AND prompt_version = $6
            "#,
        )
        .bind(raw_response)
        .bind(error)
        .bind(item.photo_id)
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_observations(&self) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM observations")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_photos(&self) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM photos")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_classifications_by_status(
        &self,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        status: ClassificationStatus,
    ) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT count(*) FROM classifications
             WHERE model_provider = $1 AND model = $2 AND prompt_version = $3 AND status = $4",
        )
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .bind(status.as_db_str())
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn count_backlog(&self, model_provider: &str, model: &str, prompt_version: &str) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT count(*)
            FROM photos p
            JOIN observations o ON o.observation_id = p.observation_id
            LEFT JOIN classifications c
              ON c.photo_id = p.photo_id
             AND c.model_provider = $1
             AND c.model = $2
             AND c.prompt_version = $3
            WHERE COALESCE(p.url_large, p.url_square, p.url_original) IS NOT NULL
              AND (
                c.classification_id IS NULL
                OR (c.status = 'failed' AND (c.retry_after IS NULL OR c.retry_after <= now()))
              )
            "#,
        )
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn count_recent_transitions(
        &self,
        model_provider: &str,
        model: &str,
        prompt_version: &str,
        status: ClassificationStatus,
        since: DateTime<Utc>,
    ) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT count(*) FROM classifications
             WHERE model_provider = $1 AND model = $2 AND prompt_version = $3
               AND status = $4 AND last_attempt_at >= $5",
        )
        .bind(model_provider)
        .bind(model)
        .bind(prompt_version)
        .bind(status.as_db_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }
}
