//! Lenient timestamp decoding for stored messages.
//!
//! Older records store `timestamp` as epoch milliseconds, newer ones as
//! RFC 3339 strings. Both decode to `DateTime<Utc>`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Float(f64),
    Text(String),
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawTimestamp>::deserialize(deserializer)?;
    let parsed = match raw {
        None => return Ok(Utc::now()),
        Some(RawTimestamp::Millis(ms)) => Utc.timestamp_millis_opt(ms).single(),
        Some(RawTimestamp::Float(ms)) => Utc.timestamp_millis_opt(ms as i64).single(),
        Some(RawTimestamp::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    };
    parsed.ok_or_else(|| serde::de::Error::custom("unrecognised timestamp"))
}
