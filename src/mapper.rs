//! Pure functions that turn iNaturalist feed JSON into [`crate::models`]
//! records. Nothing in here touches the network or the database, which is
//! what makes it straightforward to unit test.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{MappedObservation, ObservationRecord, PhotoRecord};

/// Parses an iNaturalist timestamp. The feed emits RFC 3339 with either a
/// numeric offset or a trailing `Z`; `DateTime::parse_from_rfc3339` accepts
/// both directly.
pub fn parse_inat_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Splits iNaturalist's `"lat,lon"` location string. Both halves must parse
/// as floats or neither coordinate is set.
pub fn parse_location(value: Option<&str>) -> (Option<f64>, Option<f64>) {
    let Some(value) = value else {
        return (None, None);
    };
    let Some((lat_s, lon_s)) = value.split_once(',') else {
        return (None, None);
    };
    match (lat_s.parse::<f64>(), lon_s.parse::<f64>()) {
        (Ok(lat), Ok(lon)) => (Some(lat), Some(lon)),
        _ => (None, None),
    }
}

/// Derives the square/large/original photo URLs from a single feed photo
/// entry's `url` and `original_url` fields.
///
/// `large` substitutes the path segment `/square.` with `/large.` in the
/// square URL. When `original_url` is absent, a best-effort guess
/// substitutes a literal `/square.jpg` with `/original.jpeg`, but only for
/// open-data URLs (those containing `/photos/`); the substitution is a
/// single, exact replacement, not a general find-and-replace.
pub fn best_photo_urls(photo: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let square = photo.get("url").and_then(Value::as_str).map(str::to_string);
    let mut original = photo
        .get("original_url")
        .and_then(Value::as_str)
        .map(str::to_string);

    let large = square
        .as_deref()
        .filter(|s| s.contains("square."))
        .map(|s| s.replacen("/square.", "/large.", 1));

    if original.is_none() {
        if let Some(s) = square.as_deref() {
            if s.contains("/photos/") {
                let guess = s.replacen("/square.jpg", "/original.jpeg", 1);
                if guess != s {
                    original = Some(guess);
                }
            }
        }
    }

    (square, large, original)
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_i64(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn get_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

/// Maps one raw feed observation (a single element of `results[]`) into an
/// [`ObservationRecord`] plus its [`PhotoRecord`]s, and reports the
/// observation's `updated_at` so the caller can advance the ingest cursor.
pub fn map_observation(raw: &Value) -> Option<MappedObservation> {
    let observation_id = raw.get("id")?.as_i64()?;

    let empty = Value::Null;
    let user = raw.get("user").unwrap_or(&empty);
    let taxon = raw.get("taxon").unwrap_or(&empty);

    let observed_at = parse_inat_timestamp(raw.get("time_observed_at").and_then(Value::as_str));
    let created_at = parse_inat_timestamp(raw.get("created_at").and_then(Value::as_str));
    let updated_at = parse_inat_timestamp(raw.get("updated_at").and_then(Value::as_str));

    let (latitude, longitude) = parse_location(raw.get("location").and_then(Value::as_str));

    let observation = ObservationRecord {
        observation_id,
        inat_url: format!("https://www.inaturalist.org/observations/{observation_id}"),
        taxon_id: get_i64(taxon, "id"),
        taxon_name: get_str(taxon, "name"),
        taxon_preferred_common_name: get_str(taxon, "preferred_common_name"),
        quality_grade: get_str(raw, "quality_grade"),
        captive: get_bool(raw, "captive"),
        license_code: get_str(raw, "license_code"),
        observed_at,
        observed_on: get_str(raw, "observed_on"),
        created_at,
        updated_at,
        latitude,
        longitude,
        positional_accuracy: get_i64(raw, "positional_accuracy"),
        place_guess: get_str(raw, "place_guess"),
        user_id: get_i64(user, "id"),
        user_login: get_str(user, "login"),
        description: get_str(raw, "description"),
        raw: raw.clone(),
    };

    let photos = raw
        .get("photos")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let photos = photos
        .iter()
        .enumerate()
        .filter_map(|(position, photo)| map_photo(observation_id, photo, position as i32))
        .collect();

    Some(MappedObservation {
        observation,
        photos,
        updated_at,
    })
}

/// Maps a single entry of an observation's `photos[]` array.
pub fn map_photo(observation_id: i64, raw: &Value, position: i32) -> Option<PhotoRecord> {
    let photo_id = raw.get("id")?.as_i64()?;
    let (url_square, url_large, url_original) = best_photo_urls(raw);

    Some(PhotoRecord {
        photo_id,
        observation_id,
        position,
        url_square,
        url_large,
        url_original,
        license_code: get_str(raw, "license_code"),
        attribution: get_str(raw, "attribution"),
        raw: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_trailing_z_as_utc() {
        let dt = parse_inat_timestamp(Some("2025-12-16T14:13:00Z")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-12-16T14:13:00+00:00");
    }

    #[test]
    fn parses_numeric_offset() {
        let dt = parse_inat_timestamp(Some("2025-12-16T14:13:00-08:00")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-12-16T22:13:00+00:00");
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(parse_inat_timestamp(Some("not a date")).is_none());
        assert!(parse_inat_timestamp(None).is_none());
    }

    #[test]
    fn splits_location_on_first_comma() {
        assert_eq!(parse_location(Some("40.1,-73.2")), (Some(40.1), Some(-73.2)));
    }

    #[test]
    fn location_is_all_or_nothing() {
        assert_eq!(parse_location(Some("40.1,not-a-float")), (None, None));
        assert_eq!(parse_location(Some("no-comma-here")), (None, None));
        assert_eq!(parse_location(None), (None, None));
    }

    #[test]
    fn derives_large_from_square() {
        let photo = json!({"url": "https://inaturalist-open-data.s3.amazonaws.com/photos/1/square.jpg"});
        let (square, large, original) = best_photo_urls(&photo);
        assert_eq!(square.as_deref(), Some("https://inaturalist-open-data.s3.amazonaws.com/photos/1/square.jpg"));
        assert_eq!(large.as_deref(), Some("https://inaturalist-open-data.s3.amazonaws.com/photos/1/large.jpg"));
        assert_eq!(original.as_deref(), Some("https://inaturalist-open-data.s3.amazonaws.com/photos/1/original.jpeg"));
    }

    #[test]
    fn prefers_explicit_original_url() {
        let photo = json!({
            "url": "https://static.inaturalist.org/photos/1/square.jpg",
            "original_url": "https://static.inaturalist.org/photos/1/original.jpg",
        });
        let (_, _, original) = best_photo_urls(&photo);
        assert_eq!(original.as_deref(), Some("https://static.inaturalist.org/photos/1/original.jpg"));
    }

    #[test]
    fn does_not_guess_original_outside_open_data_path() {
        let photo = json!({"url": "https://static.inaturalist.org/photos/1/square.jpg"});
        let (_, _, original) = best_photo_urls(&photo);
        assert_eq!(original, None);
    }

    #[test]
    fn maps_observation_and_its_photos() {
        let raw = json!({
            "id": 42,
            "quality_grade": "research",
            "taxon": {"id": 48662, "name": "Danaus plexippus", "preferred_common_name": "Monarch"},
            "user": {"id": 7, "login": "alice"},
            "location": "40.1,-73.2",
            "time_observed_at": "2025-12-16T14:13:00Z",
            "created_at": "2025-12-16T15:00:00Z",
            "updated_at": "2025-12-16T15:00:00Z",
            "description": "basking on milkweed",
            "photos": [
                {"id": 100, "url": "https://inaturalist-open-data.s3.amazonaws.com/photos/100/square.jpg"},
                {"id": 101, "url": "https://inaturalist-open-data.s3.amazonaws.com/photos/101/square.jpg"},
            ],
        });

        let mapped = map_observation(&raw).unwrap();
        assert_eq!(mapped.observation.observation_id, 42);
        assert_eq!(
            mapped.observation.inat_url,
            "https://www.inaturalist.org/observations/42"
        );
        assert_eq!(mapped.observation.taxon_id, Some(48662));
        assert_eq!(mapped.observation.user_login.as_deref(), Some("alice"));
        assert_eq!(mapped.photos.len(), 2);
        assert_eq!(mapped.photos[0].position, 0);
        assert_eq!(mapped.photos[1].position, 1);
        assert!(mapped.updated_at.is_some());
    }

    #[test]
    fn missing_id_is_rejected() {
        assert!(map_observation(&json!({"quality_grade": "research"})).is_none());
    }
}
