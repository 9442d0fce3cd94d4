use thiserror::Error;

/// Errors surfaced by the iNaturalist feed client.
///
/// Retries against [`FeedError::Status`] and [`FeedError::Request`] happen
/// inside the client itself (see `inat_client::InatClient::list_observations`);
/// by the time either variant escapes to the caller, the retry budget has
/// already been exhausted.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("inaturalist request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inaturalist returned http {status}")]
    Status {
        status: u16,
        retry_after: Option<u64>,
    },
}

/// Errors surfaced by the OpenRouter gateway client.
///
/// Unlike [`FeedError`], these are never retried by the client itself —
/// translating them into a retry decision is the classification engine's
/// job (`classify::retry_policy`), per the gateway's contract.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("openrouter request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("openrouter returned http {status}")]
    Status {
        status: u16,
        retry_after: Option<u64>,
    },
}

/// Errors that occur while extracting a structured object from a model
/// response's content string.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("response had no choices[0].message.content")]
    MissingContent,

    #[error("no '{{' found in model output")]
    NoOpeningBrace,

    #[error("unterminated JSON object in model output")]
    UnterminatedObject,

    #[error("could not parse model output as JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("model output parsed but was not a JSON object")]
    NotAnObject,
}

/// Everything that can go wrong while processing a single classification
/// work item, folded into one type so the retry policy can match on it.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{0} must be {1}")]
    OutOfRange(String, &'static str),
}
