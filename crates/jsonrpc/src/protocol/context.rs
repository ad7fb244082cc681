//! Context codec: carries a caller's deadline alongside request parameters.
//!
//! The envelope replaces `params` on connections that opt in on both ends:
//!
//! ```json
//! {"deadline": "2024-05-01T12:00:00.25Z", "payload": [1, 2, 3]}
//! ```
//!
//! Deadlines are always written in UTC so peers in different time zones
//! reconstruct the same instant.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::error::Result;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "rfc3339")]
    deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a RawValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvelopeIn {
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "present")]
    payload: Option<Box<RawValue>>,
}

fn rfc3339<S: Serializer>(
    deadline: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match deadline {
        Some(deadline) => {
            serializer.serialize_str(&deadline.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        None => serializer.serialize_none(),
    }
}

fn present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Box<RawValue>>, D::Error> {
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// An unwrapped envelope.
#[derive(Debug, Clone)]
pub struct Unwrapped {
    /// The propagated deadline, normalized to UTC.
    pub deadline: Option<DateTime<Utc>>,
    /// The original parameters.
    pub payload: Option<Box<RawValue>>,
}

/// Wraps `payload` in a context envelope, recording `deadline` if set.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn encode(
    deadline: Option<DateTime<Utc>>,
    payload: Option<&RawValue>,
) -> Result<Box<RawValue>> {
    Ok(serde_json::value::to_raw_value(&EnvelopeOut { deadline, payload })?)
}

/// Unwraps a context envelope.
///
/// Absent params decode as an empty envelope. The payload comes back
/// byte-identical to what was encoded.
///
/// # Errors
///
/// Returns an error if `params` is not a valid envelope.
pub fn decode(params: Option<&RawValue>) -> Result<Unwrapped> {
    let Some(params) = params else {
        return Ok(Unwrapped {
            deadline: None,
            payload: None,
        });
    };

    let envelope: EnvelopeIn = serde_json::from_str(params.get())?;
    Ok(Unwrapped {
        deadline: envelope.deadline,
        payload: envelope.payload,
    })
}

/// Time left until `deadline` on the local clock, zero if it has passed.
pub(crate) fn time_until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    #[test]
    fn test_roundtrip_without_deadline() {
        let payload = raw(r#"{"b": [1,  2], "a":"x"}"#);
        let wrapped = encode(None, Some(&payload)).unwrap();
        assert!(!wrapped.get().contains("deadline"));

        let unwrapped = decode(Some(&wrapped)).unwrap();
        assert!(unwrapped.deadline.is_none());
        assert_eq!(unwrapped.payload.unwrap().get(), payload.get());
    }

    #[test]
    fn test_roundtrip_with_deadline() {
        let deadline = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let payload = raw("[1]");

        let wrapped = encode(Some(deadline), Some(&payload)).unwrap();
        assert!(wrapped.get().contains("2030-01-02T03:04:05.123456789Z"));

        let unwrapped = decode(Some(&wrapped)).unwrap();
        assert_eq!(unwrapped.deadline, Some(deadline));
        assert_eq!(unwrapped.payload.unwrap().get(), "[1]");
    }

    #[test]
    fn test_offset_deadline_normalized_to_utc() {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2030, 6, 1, 9, 0, 0).unwrap();
        let wrapped = raw(&format!(r#"{{"deadline":"{}"}}"#, local.to_rfc3339()));

        let unwrapped = decode(Some(&wrapped)).unwrap();
        assert_eq!(
            unwrapped.deadline,
            Some(Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap())
        );
        assert!(unwrapped.payload.is_none());
    }

    #[test]
    fn test_null_payload_preserved() {
        let wrapped = raw(r#"{"payload":null}"#);
        let unwrapped = decode(Some(&wrapped)).unwrap();
        assert_eq!(unwrapped.payload.unwrap().get(), "null");
    }

    #[test]
    fn test_not_an_envelope() {
        assert!(decode(Some(&raw("[1,2]"))).is_err());
        assert!(decode(Some(&raw(r#"{"x":1}"#))).is_err());
    }

    #[test]
    fn test_time_until_past_deadline_is_zero() {
        assert_eq!(time_until(Utc::now() - chrono::Duration::seconds(5)), Duration::ZERO);
        assert!(time_until(Utc::now() + chrono::Duration::seconds(60)) > Duration::from_secs(50));
    }
}
