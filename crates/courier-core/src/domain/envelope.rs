//! Envelope: one occurrence of a domain event.
//!
//! Envelopes are immutable once built. The producer picks the dedup key, the
//! dispatcher never rewrites it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::HandlerError;

/// Discriminated event kind.
///
/// Serialized as `SCREAMING_SNAKE_CASE`, the same spelling the SQL stores
/// persist in the `event_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EnrollmentCreated,
    EnrollmentCancelled,
    AttendanceUpdated,
    SessionClosed,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::EnrollmentCreated,
        EventType::EnrollmentCancelled,
        EventType::AttendanceUpdated,
        EventType::SessionClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EnrollmentCreated => "ENROLLMENT_CREATED",
            EventType::EnrollmentCancelled => "ENROLLMENT_CANCELLED",
            EventType::AttendanceUpdated => "ATTENDANCE_UPDATED",
            EventType::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored event type name is not one we know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Producer-assigned key, unique per logical occurrence.
///
/// Handlers use it to recognize redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DedupKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DedupKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One occurrence of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    event_type: EventType,
    payload: serde_json::Value,
    dedup_key: DedupKey,
    /// Logical time of the fact, not of its delivery.
    occurred_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        event_type: EventType,
        payload: serde_json::Value,
        dedup_key: impl Into<DedupKey>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            payload,
            dedup_key: dedup_key.into(),
            occurred_at,
        }
    }

    /// Build an envelope from a typed payload.
    pub fn from_payload<T: Serialize>(
        event_type: EventType,
        payload: &T,
        dedup_key: impl Into<DedupKey>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            event_type,
            serde_json::to_value(payload)?,
            dedup_key,
            occurred_at,
        ))
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn dedup_key(&self) -> &DedupKey {
        &self.dedup_key
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Decode the payload into the type a handler expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct EnrollmentCreated {
        enrollment_id: String,
        course_id: String,
    }

    #[rstest]
    #[case::created(EventType::EnrollmentCreated)]
    #[case::cancelled(EventType::EnrollmentCancelled)]
    #[case::attendance(EventType::AttendanceUpdated)]
    #[case::session_closed(EventType::SessionClosed)]
    fn event_type_parses_its_own_name(#[case] event_type: EventType) {
        assert_eq!(event_type.as_str().parse::<EventType>(), Ok(event_type));

        let json = serde_json::to_string(&event_type).unwrap();
        assert_eq!(json, format!("\"{}\"", event_type.as_str()));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "COURSE_DELETED".parse::<EventType>().unwrap_err();
        assert_eq!(err, UnknownEventType("COURSE_DELETED".to_string()));
    }

    #[test]
    fn typed_payload_decodes_back() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let payload = EnrollmentCreated {
            enrollment_id: "enr-1".to_string(),
            course_id: "rust-101".to_string(),
        };
        let envelope =
            Envelope::from_payload(EventType::EnrollmentCreated, &payload, "enr-1:created", at)
                .unwrap();

        assert_eq!(envelope.dedup_key().as_str(), "enr-1:created");
        assert_eq!(envelope.occurred_at(), at);
        assert_eq!(envelope.payload_as::<EnrollmentCreated>().unwrap(), payload);
    }

    #[test]
    fn payload_of_wrong_shape_is_a_handler_error() {
        let envelope = Envelope::new(
            EventType::SessionClosed,
            serde_json::json!({"session": 7}),
            "session-7:closed",
            Utc::now(),
        );
        let err = envelope.payload_as::<EnrollmentCreated>().unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }
}
