//! Thin client for the iNaturalist observations feed.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::FeedError;

const BASE_URL: &str = "https://api.inaturalist.org/v1";
const USER_AGENT: &str = concat!("monarch-phenology/", env!("CARGO_PKG_VERSION"));

pub struct InatClient {
    http: reqwest::Client,
    sleep_seconds: f64,
    max_retries: u32,
    retry_backoff_seconds: f64,
}

pub struct ListObservationsParams<'a> {
    pub taxon_id: i64,
    pub place_id: i64,
    pub quality_grade: &'a str,
    pub per_page: i64,
    pub page: i64,
    pub updated_since: Option<&'a str>,
    pub order_by: &'a str,
    pub order: &'a str,
}

impl InatClient {
    pub fn new(sleep_seconds: f64, max_retries: u32, retry_backoff_seconds: f64) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            sleep_seconds,
            max_retries,
            retry_backoff_seconds,
        })
    }

    /// Fetches one page of the observations feed, retrying transient
    /// failures (429/5xx/network) with a linear backoff, then sleeping
    /// `sleep_seconds` before returning so the feed is never hammered.
    pub async fn list_observations(&self, params: &ListObservationsParams<'_>) -> Result<Value, FeedError> {
        let url = format!("{BASE_URL}/observations");
        let mut attempt = 0u32;

        let body = loop {
            let mut query = vec![
                ("taxon_id".to_string(), params.taxon_id.to_string()),
                ("place_id".to_string(), params.place_id.to_string()),
                ("quality_grade".to_string(), params.quality_grade.to_string()),
                ("per_page".to_string(), params.per_page.to_string()),
                ("page".to_string(), params.page.to_string()),
                ("order_by".to_string(), params.order_by.to_string()),
                ("order".to_string(), params.order.to_string()),
            ];
            if let Some(updated_since) = params.updated_since.filter(|s| !s.is_empty()) {
                query.push(("updated_since".to_string(), updated_since.to_string()));
            }

            let response = match self.http.get(&url).query(&query).send().await {
                Ok(response) => response,
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(FeedError::Request(err));
                    }
                    let delay = Duration::from_secs_f64(self.retry_backoff_seconds * (attempt + 1) as f64);
                    warn!(error = %err, attempt, delay_secs = delay.as_secs(), "inaturalist feed request errored, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };
            let status = response.status();

            if status.is_success() {
                break response.json::<Value>().await?;
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            if attempt >= self.max_retries
                || !(status.as_u16() == 429 || status.is_server_error())
            {
                return Err(FeedError::Status {
                    status: status.as_u16(),
                    retry_after,
                });
            }

            let delay = retry_after
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs_f64(self.retry_backoff_seconds * (attempt + 1) as f64));
            warn!(status = status.as_u16(), attempt, delay_secs = delay.as_secs(), "inaturalist feed request failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        if self.sleep_seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.sleep_seconds)).await;
        }

        Ok(body)
    }
}
