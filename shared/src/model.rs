use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::queue::QueueError;

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed since `earlier`; zero if `earlier` lies in the future.
    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Validated business identifier (tracking number) - the dedup key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusinessKey(String);

impl BusinessKey {
    const MAX_LENGTH: usize = 128;

    pub fn new(key: impl Into<String>) -> Result<Self, QueueError> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            return Err(QueueError::InvalidItem("business key cannot be empty".into()));
        }
        if key.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidItem(format!(
                "business key exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(QueueError::InvalidItem(
                "business key contains control characters".into(),
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BusinessKey {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BusinessKey> for String {
    fn from(key: BusinessKey) -> Self {
        key.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated destination phone number, stored in compact form (`+38970000000`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination(String);

impl Destination {
    const MAX_LENGTH: usize = 32;

    pub fn new(number: impl Into<String>) -> Result<Self, QueueError> {
        let raw = number.into();
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();

        if compact.is_empty() {
            return Err(QueueError::InvalidItem("destination is required".into()));
        }
        if compact.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidItem(format!(
                "destination exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }

        let digits = compact.strip_prefix('+').unwrap_or(&compact);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(QueueError::InvalidItem(format!(
                "destination '{}' is not a phone number",
                raw.trim()
            )));
        }

        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Destination {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Destination> for String {
    fn from(dest: Destination) -> Self {
        dest.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Business status code the send is conditioned on (e.g. "in transit")
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessStatus(pub i32);

impl fmt::Display for BusinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque fields the message builder needs (names, amounts, locale hints).
/// Ordered so the persisted form is stable.
pub type PayloadFields = BTreeMap<String, String>;

/// Unvalidated send request as callers assemble it from a scanned parcel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub business_key: String,
    pub destination: String,
    pub payload_fields: PayloadFields,
    pub status: BusinessStatus,
}

/// One pending send request. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueItem {
    pub business_key: BusinessKey,
    pub destination: Destination,
    pub payload_fields: PayloadFields,
    pub status_at_enqueue: BusinessStatus,
    pub created_at: UnixTimeMs,
}

impl QueueItem {
    /// Validate raw caller input into an item. Any invalid field yields
    /// `QueueError::InvalidItem` and nothing is queued.
    pub fn new(
        business_key: impl Into<String>,
        destination: impl Into<String>,
        status_at_enqueue: BusinessStatus,
        now: UnixTimeMs,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            business_key: BusinessKey::new(business_key)?,
            destination: Destination::new(destination)?,
            payload_fields: PayloadFields::new(),
            status_at_enqueue,
            created_at: now,
        })
    }

    pub fn from_request(request: SendRequest, now: UnixTimeMs) -> Result<Self, QueueError> {
        Ok(Self::new(request.business_key, request.destination, request.status, now)?
            .with_fields(request.payload_fields))
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload_fields.insert(name.into(), value.into());
        self
    }

    pub fn with_fields(mut self, fields: PayloadFields) -> Self {
        self.payload_fields.extend(fields);
        self
    }

    pub fn key(&self) -> &BusinessKey {
        &self.business_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_key_trims_whitespace() {
        let key = BusinessKey::new("  T100  ").unwrap();
        assert_eq!(key.as_str(), "T100");
    }

    #[test]
    fn business_key_validation() {
        assert!(BusinessKey::new("RR123456789MK").is_ok());
        assert!(BusinessKey::new("").is_err());
        assert!(BusinessKey::new("   ").is_err());
        assert!(BusinessKey::new("a\nb").is_err());
        assert!(BusinessKey::new("a".repeat(129)).is_err());
    }

    #[test]
    fn destination_is_compacted() {
        let dest = Destination::new(" +389 70 (000) 000-00 ").unwrap();
        assert_eq!(dest.as_str(), "+3897000000000");
    }

    #[test]
    fn destination_validation() {
        assert!(Destination::new("+38970000000").is_ok());
        assert!(Destination::new("070000000").is_ok());
        assert!(Destination::new("").is_err());
        assert!(Destination::new("+").is_err());
        assert!(Destination::new("call me").is_err());
        assert!(Destination::new("1".repeat(33)).is_err());
    }

    #[test]
    fn missing_destination_rejects_item() {
        let result = QueueItem::new("T100", "  ", BusinessStatus(3), UnixTimeMs(0));
        assert!(matches!(result, Err(QueueError::InvalidItem(_))));
    }

    #[test]
    fn item_builder_collects_fields() {
        let item = QueueItem::new("T100", "+38970000000", BusinessStatus(3), UnixTimeMs(5))
            .unwrap()
            .with_field("recipient", "Ana")
            .with_field("locale", "mk");

        assert_eq!(item.payload_fields.len(), 2);
        assert_eq!(item.payload_fields["locale"], "mk");
        assert_eq!(item.created_at, UnixTimeMs(5));
    }

    #[test]
    fn request_converts_into_item() {
        let request = SendRequest {
            business_key: " T100 ".into(),
            destination: "+389 70 000 000".into(),
            payload_fields: [("amount".to_string(), "120 MKD".to_string())].into(),
            status: BusinessStatus(3),
        };
        let item = QueueItem::from_request(request, UnixTimeMs(1)).unwrap();
        assert_eq!(item.business_key.as_str(), "T100");
        assert_eq!(item.destination.as_str(), "+38970000000");
        assert_eq!(item.payload_fields["amount"], "120 MKD");

        let empty = SendRequest::default();
        assert!(matches!(
            QueueItem::from_request(empty, UnixTimeMs(1)),
            Err(QueueError::InvalidItem(_))
        ));
    }

    #[test]
    fn deserialization_revalidates_keys() {
        let ok: BusinessKey = serde_json::from_str("\"T100\"").unwrap();
        assert_eq!(ok.as_str(), "T100");
        assert!(serde_json::from_str::<BusinessKey>("\"\"").is_err());
        assert!(serde_json::from_str::<Destination>("\"abc\"").is_err());
    }

    #[test]
    fn millis_since_saturates() {
        assert_eq!(UnixTimeMs(10).millis_since(UnixTimeMs(4)), 6);
        assert_eq!(UnixTimeMs(4).millis_since(UnixTimeMs(10)), 0);
    }
}
