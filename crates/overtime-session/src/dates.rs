//! Lenient ISO-8601 date decoding for API payloads.
//!
//! The API emits timestamps both with and without fractional seconds, and
//! occasionally without an offset. All of them decode to UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, de};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 timestamp into UTC.
pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Offsets without a colon, e.g. `+0000`.
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("invalid ISO-8601 date: {}", raw))
}

/// `deserialize_with` helper for optional timestamps.
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse(&s).map_err(de::Error::custom)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_variants() {
        for raw in [
            "2024-08-23T10:15:30Z",
            "2024-08-23T10:15:30.123Z",
            "2024-08-23T10:15:30.123+00:00",
            "2024-08-23T10:15:30.123+0000",
            "2024-08-23T10:15:30",
        ] {
            let dt = parse(raw).unwrap_or_else(|e| panic!("{}: {}", raw, e));
            assert_eq!(dt.year(), 2024);
            assert_eq!(dt.hour(), 10);
            assert_eq!(dt.second(), 30);
        }
    }

    #[test]
    fn test_parse_applies_offset() {
        let dt = parse("2024-08-23T12:00:00+02:00").unwrap();
        assert_eq!(dt.hour(), 10);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("yesterday").is_err());
    }

    #[test]
    fn test_deserialize_option() {
        #[derive(Deserialize)]
        struct Payload {
            #[serde(default, deserialize_with = "deserialize_option")]
            at: Option<DateTime<Utc>>,
        }

        let p: Payload = serde_json::from_str(r#"{"at": "2024-08-23T10:15:30.5Z"}"#).unwrap();
        assert!(p.at.is_some());

        let p: Payload = serde_json::from_str(r#"{"at": null}"#).unwrap();
        assert!(p.at.is_none());

        let p: Payload = serde_json::from_str(r#"{}"#).unwrap();
        assert!(p.at.is_none());

        assert!(serde_json::from_str::<Payload>(r#"{"at": "nope"}"#).is_err());
    }
}
