//! Drives one classification pass: selects due photos, reserves them with
//! a `pending` row, fans work out to a bounded pool of workers that only
//! talk to the gateway, and commits each result as it comes back.
//!
//! Workers never touch the database — only this controller does, which
//! keeps write ordering simple to reason about even with several workers
//! in flight.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::db::Db;
use crate::error::{ClassifyError, ContentError, GatewayError};
use crate::models::WorkItem;
use crate::openrouter_client::{prompt_hash, OpenRouterClient};

pub const MODEL_PROVIDER: &str = "openrouter";

pub struct ClassifyConfig {
    pub api_key: String,
    pub model: String,
    pub prompt_version: String,
    pub prompt: String,
    pub notes_max_chars: i64,
    pub max_workers: usize,
    pub max_attempts: i32,
    pub max_items: i64,
    pub sleep_seconds: f64,
}

#[derive(Debug, Default)]
pub struct ClassifyOutcome {
    pub succeeded: u64,
    pub failed: u64,
}

struct PreparedItem {
    item: WorkItem,
    notes: String,
}

/// Runs one classification pass and returns how many items succeeded or
/// failed. A `max_items` of zero, or no photos due, is a no-op.
pub async fn classify(db: &Db, cfg: &ClassifyConfig) -> eyre::Result<ClassifyOutcome> {
    db.ensure_schema().await?;

    let p_hash = prompt_hash(&cfg.prompt);
    let items = db
        .select_next_work(MODEL_PROVIDER, &cfg.model, &cfg.prompt_version, cfg.max_items)
        .await?;
    if items.is_empty() {
        return Ok(ClassifyOutcome::default());
    }

    // Every reservation lands in one transaction: either the whole batch is
    // claimed as `pending` or none of it is, so a crash between reservation
    // and dispatch never leaves half a batch silently un-reserved.
    let mut prepared = Vec::with_capacity(items.len());
    let mut tx = db.begin().await?;
    for item in items {
        let (notes, truncated) = truncate_notes(&item.notes, cfg.notes_max_chars);
        Db::upsert_pending(&mut *tx, &item, MODEL_PROVIDER, &cfg.model, &cfg.prompt_version, &p_hash, &notes, truncated)
            .await?;
        prepared.push(PreparedItem { item, notes });
    }
    tx.commit().await?;

    let max_workers = cfg.max_workers.max(1);
    let mut outcome = ClassifyOutcome::default();

    let mut results = stream::iter(prepared.into_iter().map(|p| async move {
        // Each task builds and disposes its own gateway client, so no state
        // (connection pool, cookies) leaks between classification attempts.
        let result = match OpenRouterClient::new(cfg.api_key.clone(), cfg.model.clone()) {
            Ok(client) => client.classify_image(&p.item.image_url, &p.notes, &cfg.prompt).await,
            Err(err) => Err(err),
        };
        (p.item, result)
    }))
    .buffer_unordered(max_workers);

    while let Some((item, gateway_result)) = results.next().await {
        let attempt = item.attempt_count + 1;

        let outcome_result: Result<(Value, Value), (ClassifyError, Option<Value>)> = match gateway_result {
            Ok(raw) => match extract_content_json(&raw) {
                Ok(output) => Ok((output, raw)),
                Err(content_err) => Err((ClassifyError::from(content_err), Some(raw))),
            },
            Err(gateway_err) => Err((ClassifyError::from(gateway_err), None)),
        };

        match outcome_result {
            Ok((output, raw_response)) => {
                db.mark_succeeded(&item, MODEL_PROVIDER, &cfg.model, &cfg.prompt_version, &output, &raw_response)
                    .await?;
                outcome.succeeded += 1;
            }
            Err((err, raw_response)) => {
                let (permanent, retry_seconds, reason) = retry_policy(&err, attempt);
                let message = format!("{reason}: {err}");

                if permanent || attempt >= cfg.max_attempts {
                    db.mark_permanent_failed(
                        &item,
                        MODEL_PROVIDER,
                        &cfg.model,
                        &cfg.prompt_version,
                        &message,
                        raw_response.as_ref(),
                    )
                    .await?;
                } else {
                    db.mark_failed(
                        &item,
                        MODEL_PROVIDER,
                        &cfg.model,
                        &cfg.prompt_version,
                        &message,
                        retry_seconds,
                        cfg.max_attempts,
                        raw_response.as_ref(),
                    )
                    .await?;
                }
                outcome.failed += 1;
                warn!(photo_id = item.photo_id, attempt, error = %message, "classification failed");
            }
        }

        if cfg.sleep_seconds > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(cfg.sleep_seconds)).await;
        }
    }

    Ok(outcome)
}

fn truncate_notes(notes: &str, max_chars: i64) -> (String, bool) {
    if max_chars <= 0 || (notes.chars().count() as i64) <= max_chars {
        return (notes.to_string(), false);
    }
    let truncated: String = notes.chars().take(max_chars as usize).collect();
    (truncated, true)
}

fn extract_content_json(raw: &Value) -> Result<Value, ContentError> {
    let content = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .ok_or(ContentError::MissingContent)?;

    if content.is_object() {
        return Ok(content.clone());
    }
    let text = content.as_str().ok_or(ContentError::MissingContent)?;
    parse_model_json(text)
}

/// Tries, in order: parsing the whole text directly as a JSON object, then
/// stripping a surrounding code fence and balancing braces to recover the
/// first JSON object embedded in the text. Mirrors what models that ignore
/// `response_format` tend to actually emit.
fn parse_model_json(text: &str) -> Result<Value, ContentError> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let candidate = extract_first_json_object(text)?;
    let value: Value = serde_json::from_str(&candidate)?;
    if !value.is_object() {
        return Err(ContentError::NotAnObject);
    }
    Ok(value)
}

fn strip_code_fences(text: &str) -> String {
    let stripped = text.trim();
    if !stripped.starts_with("```") {
        return stripped.to_string();
    }

    let mut lines: Vec<&str> = stripped.split('\n').collect();
    if lines.len() >= 2 && lines[0].starts_with("```") {
        lines.remove(0);
    }
    let mut body = lines.join("\n");
    let trimmed_end = body.trim_end();
    if trimmed_end.ends_with("```") {
        body = trimmed_end[..trimmed_end.len() - "```".len()].trim_end().to_string();
    }
    body.trim().to_string()
}

fn extract_first_json_object(text: &str) -> Result<String, ContentError> {
    let text = strip_code_fences(text);
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|&c| c == '{').ok_or(ContentError::NoOpeningBrace)?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;

    for (offset, &ch) in chars[start..].iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Ok(chars[start..end].iter().collect());
                }
            }
            _ => {}
        }
    }

    Err(ContentError::UnterminatedObject)
}

fn retry_seconds_for_attempt(attempt: i32, base: i64, cap: i64) -> i64 {
    let exponent = (attempt - 1).max(0);
    let scaled = base.saturating_mul(1i64 << exponent.min(32));
    scaled.min(cap)
}

/// Returns `(permanent, retry_after_seconds, reason)` for one failed
/// attempt. A 429 with a `Retry-After` header wins over the default table;
/// everything else follows the pinned base/cap per failure kind.
fn retry_policy(error: &ClassifyError, attempt: i32) -> (bool, i64, &'static str) {
    match error {
        ClassifyError::Gateway(GatewayError::Status { status: 429, retry_after: Some(seconds) }) => {
            (false, *seconds as i64, "rate limited")
        }
        ClassifyError::Gateway(GatewayError::Status { status: 429, retry_after: None }) => {
            (false, retry_seconds_for_attempt(attempt, 10, 300), "rate limited")
        }
        ClassifyError::Gateway(GatewayError::Status { status, .. }) if (500..600).contains(status) => {
            (false, retry_seconds_for_attempt(attempt, 30, 1800), "server error")
        }
        ClassifyError::Gateway(GatewayError::Status { .. }) => (true, 0, "client error"),
        ClassifyError::Gateway(GatewayError::Request(_)) => {
            (false, retry_seconds_for_attempt(attempt, 10, 600), "network error")
        }
        ClassifyError::Content(ContentError::InvalidJson(_))
        | ClassifyError::Content(ContentError::NoOpeningBrace)
        | ClassifyError::Content(ContentError::UnterminatedObject)
        | ClassifyError::Content(ContentError::NotAnObject) => {
            (false, retry_seconds_for_attempt(attempt, 60, 1800), "invalid JSON response")
        }
        ClassifyError::Content(ContentError::MissingContent) => {
            (false, retry_seconds_for_attempt(attempt, 60, 3600), "unexpected error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_direct_json_object() {
        let value = parse_model_json(r#"{"stage": "larva"}"#).unwrap();
        assert_eq!(value, json!({"stage": "larva"}));
    }

    #[test]
    fn strips_code_fence_with_language_tag() {
        let text = "```json\n{\"stage\": \"pupa\"}\n```";
        let value = parse_model_json(text).unwrap();
        assert_eq!(value, json!({"stage": "pupa"}));
    }

    #[test]
    fn recovers_object_from_surrounding_prose() {
        let text = "Sure, here you go: {\"stage\": \"adult\", \"note\": \"a { nested } brace\"} thanks!";
        let value = parse_model_json(text).unwrap();
        assert_eq!(value, json!({"stage": "adult", "note": "a { nested } brace"}));
    }

    #[test]
    fn balances_braces_inside_strings() {
        let text = r#"{"quote": "she said \"{not json}\""}"#;
        let value = parse_model_json(text).unwrap();
        assert_eq!(value["quote"], "she said \"{not json}\"");
    }

    #[test]
    fn rejects_text_with_no_opening_brace() {
        assert!(matches!(parse_model_json("no object here"), Err(ContentError::NoOpeningBrace)));
    }

    #[test]
    fn rejects_unterminated_object() {
        assert!(matches!(
            parse_model_json("{\"stage\": \"larva\""),
            Err(ContentError::UnterminatedObject)
        ));
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(matches!(parse_model_json("[1, 2, 3]"), Err(ContentError::NoOpeningBrace)));
    }

    #[test]
    fn truncates_notes_over_the_limit() {
        let (notes, truncated) = truncate_notes("abcdef", 3);
        assert_eq!(notes, "abc");
        assert!(truncated);
    }

    #[test]
    fn leaves_short_notes_untouched() {
        let (notes, truncated) = truncate_notes("ab", 3);
        assert_eq!(notes, "ab");
        assert!(!truncated);
    }

    #[test]
    fn zero_max_chars_disables_truncation() {
        let (notes, truncated) = truncate_notes("abcdef", 0);
        assert_eq!(notes, "abcdef");
        assert!(!truncated);
    }

    #[test]
    fn retry_after_header_wins_over_default_table() {
        let err = ClassifyError::Gateway(GatewayError::Status { status: 429, retry_after: Some(120) });
        assert_eq!(retry_policy(&err, 1), (false, 120, "rate limited"));
    }

    #[test]
    fn rate_limit_without_header_uses_backoff_table() {
        let err = ClassifyError::Gateway(GatewayError::Status { status: 429, retry_after: None });
        assert_eq!(retry_policy(&err, 3), (false, 40, "rate limited"));
    }

    #[test]
    fn server_error_backoff_caps_at_1800() {
        let err = ClassifyError::Gateway(GatewayError::Status { status: 503, retry_after: None });
        assert_eq!(retry_policy(&err, 10), (false, 1800, "server error"));
    }

    #[test]
    fn other_4xx_is_permanent() {
        let err = ClassifyError::Gateway(GatewayError::Status { status: 401, retry_after: None });
        assert_eq!(retry_policy(&err, 1), (true, 0, "client error"));
    }

    #[test]
    fn json_decode_error_is_retryable_with_its_own_table() {
        let err = ClassifyError::Content(ContentError::NoOpeningBrace);
        assert_eq!(retry_policy(&err, 1), (false, 60, "invalid JSON response"));
    }
}
