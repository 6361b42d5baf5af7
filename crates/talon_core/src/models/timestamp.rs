//! Lenient server timestamp decoding.
//!
//! The server emits times as epoch seconds, epoch nanoseconds or ISO-8601 strings
//! depending on the API and version. Numbers above [`NANOSECOND_THRESHOLD`] are read
//! as nanoseconds, smaller numbers as seconds; strings are parsed as RFC 3339 with or
//! without fractional seconds, then as a naive UTC timestamp.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Magnitude above which a numeric timestamp is taken to be nanoseconds.
pub const NANOSECOND_THRESHOLD: f64 = 1e12;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Interpret an epoch number.
pub fn from_epoch_number(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let seconds = if value.abs() > NANOSECOND_THRESHOLD { value / 1e9 } else { value };
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos).single()
}

/// Parse an ISO-8601 timestamp string.
pub fn from_iso8601(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Decode any supported JSON representation.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(from_epoch_number),
        serde_json::Value::String(s) => {
            from_iso8601(s).or_else(|| s.trim().parse::<f64>().ok().and_then(from_epoch_number))
        }
        _ => None,
    }
}

/// Serde adapter: `#[serde(with = "flexible")]` on a `DateTime<Utc>` field.
pub mod flexible {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as RFC 3339.
    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    /// Deserialize from epoch seconds, epoch nanoseconds or ISO-8601.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {raw}")))
    }
}

/// Serde adapter for `Option<DateTime<Utc>>`; null and absent map to `None`.
pub mod flexible_option {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as RFC 3339 or null.
    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize, treating null as `None` and any other value as a timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        match raw {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => parse_timestamp(&value)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {value}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    // 2024-03-01T12:30:45Z
    const KNOWN_SECS: i64 = 1_709_296_245;

    fn known() -> DateTime<Utc> {
        Utc.timestamp_opt(KNOWN_SECS, 0).unwrap()
    }

    fn assert_close(actual: DateTime<Utc>) {
        let delta = (actual - known()).num_milliseconds().abs();
        assert!(delta < 1000, "{actual} is {delta}ms from {}", known());
    }

    #[test]
    fn test_epoch_seconds() {
        assert_close(parse_timestamp(&json!(KNOWN_SECS)).unwrap());
        assert_close(parse_timestamp(&json!(KNOWN_SECS as f64 + 0.5)).unwrap());
    }

    #[test]
    fn test_epoch_nanoseconds() {
        let nanos = KNOWN_SECS as i128 * 1_000_000_000 + 123_456_789;
        let value: serde_json::Value = serde_json::from_str(&nanos.to_string()).unwrap();
        assert_close(parse_timestamp(&value).unwrap());
    }

    #[test]
    fn test_iso8601_with_and_without_fraction() {
        assert_close(parse_timestamp(&json!("2024-03-01T12:30:45Z")).unwrap());
        assert_close(parse_timestamp(&json!("2024-03-01T12:30:45.987654Z")).unwrap());
        assert_close(parse_timestamp(&json!("2024-03-01T14:30:45+02:00")).unwrap());
        assert_close(parse_timestamp(&json!("2024-03-01T12:30:45")).unwrap());
    }

    #[test]
    fn test_unparseable_values() {
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn test_serde_adapters() {
        #[derive(Deserialize)]
        struct Sample {
            #[serde(with = "flexible")]
            created: DateTime<Utc>,
            #[serde(default, with = "flexible_option")]
            finished: Option<DateTime<Utc>>,
        }

        let sample: Sample = serde_json::from_value(json!({ "created": KNOWN_SECS })).unwrap();
        assert_close(sample.created);
        assert!(sample.finished.is_none());

        let sample: Sample = serde_json::from_value(
            json!({ "created": "2024-03-01T12:30:45Z", "finished": null }),
        )
        .unwrap();
        assert_close(sample.created);
        assert!(sample.finished.is_none());

        assert!(serde_json::from_value::<Sample>(json!({ "created": "soon" })).is_err());
    }
}
