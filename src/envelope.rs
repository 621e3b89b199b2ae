//! Typed retry metadata carried in message properties.

use chrono::{DateTime, TimeZone, Utc};

use crate::broker::{HeaderValue, MessageProperties};

/// Header holding the number of failed attempts so far.
pub const RETRY_HEADER: &str = "x-retries";
/// Header holding the envelope layout version.
pub const ENVELOPE_VERSION_HEADER: &str = "x-envelope-version";
/// Layout written by this crate.
pub const ENVELOPE_VERSION: u32 = 1;

/// Retry state of a delivery.
///
/// A first delivery has no retry header and reads as `retry_count == 0`. Every
/// republish for another attempt carries the incremented count, the same message id
/// and a fresh timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    pub version: u32,
    pub retry_count: u32,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RetryEnvelope {
    /// Reads the envelope from delivery properties.
    ///
    /// Missing, negative or unparsable retry headers count as zero, and a missing
    /// version is taken as the current one, so messages from other producers are
    /// accepted as first deliveries.
    pub fn from_properties(properties: &MessageProperties) -> Self {
        let retry_count = properties
            .header(RETRY_HEADER)
            .and_then(HeaderValue::as_int)
            .map_or(0, |count| count.clamp(0, i64::from(u32::MAX)) as u32);
        let version = properties
            .header(ENVELOPE_VERSION_HEADER)
            .and_then(HeaderValue::as_int)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(ENVELOPE_VERSION);
        let timestamp = properties
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Self {
            version,
            retry_count,
            message_id: properties.message_id.clone(),
            timestamp,
        }
    }

    /// Envelope for the next attempt after a failure.
    pub fn next_attempt(&self) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            retry_count: self.retry_count.saturating_add(1),
            message_id: self.message_id.clone(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Properties for republishing `original` under this envelope.
    ///
    /// Persistence and every other header are kept; the retry and version headers,
    /// the message id and the timestamp come from the envelope.
    pub fn apply(&self, original: &MessageProperties) -> MessageProperties {
        let mut properties = original.clone();
        properties
            .headers
            .insert(RETRY_HEADER.to_string(), HeaderValue::Int(i64::from(self.retry_count)));
        properties.headers.insert(
            ENVELOPE_VERSION_HEADER.to_string(),
            HeaderValue::Int(i64::from(self.version)),
        );
        properties.message_id = self
            .message_id
            .clone()
            .or_else(|| Some(uuid::Uuid::new_v4().to_string()));
        properties.timestamp = self
            .timestamp
            .map(|ts| ts.timestamp().max(0) as u64)
            .or(original.timestamp);
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delivery_has_zero_retries() {
        let properties = MessageProperties::for_publish(true);
        let envelope = RetryEnvelope::from_properties(&properties);

        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(envelope.message_id, properties.message_id);
        assert!(envelope.timestamp.is_some());
    }

    #[test]
    fn retry_header_accepts_strings_and_ignores_negatives() {
        let mut properties = MessageProperties::default();
        properties
            .headers
            .insert(RETRY_HEADER.into(), HeaderValue::Str("2".into()));
        assert_eq!(RetryEnvelope::from_properties(&properties).retry_count, 2);

        properties.headers.insert(RETRY_HEADER.into(), HeaderValue::Int(-4));
        assert_eq!(RetryEnvelope::from_properties(&properties).retry_count, 0);
    }

    #[test]
    fn apply_keeps_identity_and_foreign_headers() {
        let mut original = MessageProperties::for_publish(true);
        original
            .headers
            .insert("x-tenant".into(), HeaderValue::Str("acme".into()));

        let next = RetryEnvelope::from_properties(&original).next_attempt();
        let republished = next.apply(&original);

        assert!(republished.persistent);
        assert_eq!(republished.message_id, original.message_id);
        assert_eq!(republished.header(RETRY_HEADER), Some(&HeaderValue::Int(1)));
        assert_eq!(
            republished.header("x-tenant"),
            Some(&HeaderValue::Str("acme".into()))
        );
        assert_eq!(RetryEnvelope::from_properties(&republished).retry_count, 1);
    }

    #[test]
    fn apply_fills_missing_message_id() {
        let original = MessageProperties::default();
        let republished = RetryEnvelope::from_properties(&original)
            .next_attempt()
            .apply(&original);

        assert!(republished.message_id.is_some());
        assert!(!republished.persistent);
    }
}
