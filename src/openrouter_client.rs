//! Thin client for the OpenRouter chat-completions gateway.

use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

const BASE_URL: &str = "https://openrouter.ai/api/v1";

/// `sha256(prompt)` hex-encoded, stored alongside each classification so a
/// prompt change is visible in the data without needing to diff prose.
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    format!("{digest:x}")
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, api_key, model })
    }

    /// Sends one image + observer-notes classification request. Never
    /// retries internally — the caller's retry policy decides what to do
    /// with the error.
    pub async fn classify_image(
        &self,
        image_url: &str,
        observer_notes: &str,
        prompt: &str,
    ) -> Result<Value, GatewayError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": format!("Observer notes:\n{observer_notes}")},
                        {"type": "image_url", "image_url": {"url": image_url}},
                    ],
                },
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .http
            .post(format!("{BASE_URL}/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(GatewayError::Status {
                status: status.as_u16(),
                retry_after,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_hash_is_stable_sha256_hex() {
        assert_eq!(
            prompt_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn prompt_hash_changes_with_prompt() {
        assert_ne!(prompt_hash("a"), prompt_hash("b"));
    }
}
