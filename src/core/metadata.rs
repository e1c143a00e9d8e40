//! Per-stream metadata carried in `$$S` streams.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::stream::EventNumber;

/// Event type of metadata events.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Retention and caching policy for a stream. Unknown fields written by
/// clients are preserved opaquely in `custom`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamMetadata {
    #[serde(rename = "$maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
    #[serde(rename = "$maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    #[serde(rename = "$tb", skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<EventNumber>,
    #[serde(rename = "$cacheControl", skip_serializing_if = "Option::is_none")]
    pub cache_control_ms: Option<u64>,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl StreamMetadata {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// First visible event number given the stream tail. `$tb` takes
    /// precedence over `$maxCount` when both exclude an event.
    pub fn visibility_floor(&self, tail: EventNumber) -> EventNumber {
        let mut floor = 0i64;
        if let Some(max_count) = self.max_count {
            let max_count = max_count.min(i64::MAX as u64) as i64;
            let by_count = tail.get().saturating_sub(max_count).saturating_add(1);
            floor = floor.max(by_count);
        }
        if let Some(tb) = self.truncate_before {
            floor = floor.max(tb.get());
        }
        EventNumber::new(floor).unwrap_or(EventNumber::ZERO)
    }

    /// Whether an event created at `created_ms` has aged out at `now_ms`.
    pub fn is_expired(&self, created_ms: u64, now_ms: u64) -> bool {
        match self.max_age_ms {
            Some(max_age) => now_ms.saturating_sub(created_ms) > max_age,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_custom_fields() {
        let raw = br#"{"$maxCount":100,"$tb":7,"owner":"billing"}"#;
        let meta = StreamMetadata::from_json_bytes(raw).unwrap();
        assert_eq!(meta.max_count, Some(100));
        assert_eq!(meta.truncate_before, Some(EventNumber::new(7).unwrap()));
        assert_eq!(meta.custom.get("owner"), Some(&Value::from("billing")));

        let bytes = meta.to_json_bytes().unwrap();
        let back = StreamMetadata::from_json_bytes(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn truncate_before_takes_precedence_over_max_count() {
        let meta = StreamMetadata {
            max_count: Some(100),
            truncate_before: Some(EventNumber::new(50).unwrap()),
            ..StreamMetadata::default()
        };
        // Tail 59: max-count alone would keep everything, $tb still truncates.
        assert_eq!(
            meta.visibility_floor(EventNumber::new(59).unwrap()).get(),
            50
        );
        // Tail 500: max-count floor (401) is higher and wins.
        assert_eq!(
            meta.visibility_floor(EventNumber::new(500).unwrap()).get(),
            401
        );
    }

    #[test]
    fn max_age_expiry() {
        let meta = StreamMetadata {
            max_age_ms: Some(1_000),
            ..StreamMetadata::default()
        };
        assert!(!meta.is_expired(10_000, 10_500));
        assert!(meta.is_expired(10_000, 11_500));
    }
}
