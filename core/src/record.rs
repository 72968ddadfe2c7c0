//! Idempotency records and claim outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status of an idempotency record.
///
/// Transitions are monotonic: `Processing -> Completed` or
/// `Processing -> Failed`. A failed record may be re-claimed (which writes a
/// fresh `Processing` record), a completed one is only ever overwritten by
/// another completion or removed by expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// A claimant owns the key and is executing the operation.
    Processing,
    /// The operation succeeded; the cached result may be replayed.
    Completed,
    /// The operation failed; the key may be claimed again.
    Failed,
}

/// Persisted state of one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// The idempotency key (unprefixed).
    pub key: String,

    /// Message that claimed the key.
    pub message_id: String,

    /// Correlation id of the claiming unit of work.
    pub correlation_id: String,

    /// Current status.
    pub status: OperationStatus,

    /// Cached result, present once completed. A JSON `null` result is
    /// `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,

    /// Failure message, present once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the key was first claimed.
    pub created_at: DateTime<Utc>,

    /// When the store will drop the record.
    pub expires_at: DateTime<Utc>,

    /// Number of recorded failures for this key.
    #[serde(default)]
    pub retry_count: u32,
}

impl IdempotencyRecord {
    /// Create a fresh processing record.
    #[must_use]
    pub fn processing(
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        message_id: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            message_id: message_id.into(),
            correlation_id: correlation_id.into(),
            status: OperationStatus::Processing,
            result: None,
            error: None,
            created_at,
            expires_at,
            retry_count: 0,
        }
    }

    /// Whether the cached result may be replayed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }

    /// Encode for storage.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the cached result cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from storage.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the bytes are not a valid record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A field that is present decodes to `Some`, even when it holds `null`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Result of a read-only idempotency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyCheck {
    /// No live claim (absent, expired, failed, or store unreachable).
    New,
    /// Another caller holds a processing claim.
    Duplicate,
    /// A completed result is cached.
    Completed,
}

impl From<Option<&IdempotencyRecord>> for IdempotencyCheck {
    fn from(record: Option<&IdempotencyRecord>) -> Self {
        match record.map(|r| r.status) {
            Some(OperationStatus::Completed) => Self::Completed,
            Some(OperationStatus::Processing) => Self::Duplicate,
            Some(OperationStatus::Failed) | None => Self::New,
        }
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOutcome {
    /// This caller won the claim and must complete or fail it.
    New,
    /// Someone else holds (or held) the key.
    Duplicate,
}

impl ClaimOutcome {
    /// Whether the claim was won.
    #[must_use]
    pub const fn is_new(self) -> bool {
        matches!(self, Self::New)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: OperationStatus) -> IdempotencyRecord {
        let now = Utc::now();
        let mut record =
            IdempotencyRecord::processing("k", "corr-1", "msg-1", now, now + Duration::hours(1));
        record.status = status;
        record
    }

    #[test]
    fn check_maps_status() {
        assert_eq!(IdempotencyCheck::from(None), IdempotencyCheck::New);
        assert_eq!(
            IdempotencyCheck::from(Some(&record(OperationStatus::Processing))),
            IdempotencyCheck::Duplicate
        );
        assert_eq!(
            IdempotencyCheck::from(Some(&record(OperationStatus::Completed))),
            IdempotencyCheck::Completed
        );
        assert_eq!(
            IdempotencyCheck::from(Some(&record(OperationStatus::Failed))),
            IdempotencyCheck::New
        );
    }

    #[test]
    fn record_uses_camel_case_wire_format() {
        let json = serde_json::to_value(record(OperationStatus::Processing)).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["messageId"], "msg-1");
        assert_eq!(json["retryCount"], 0);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn null_result_survives_storage() {
        let mut completed = record(OperationStatus::Completed);
        completed.result = Some(serde_json::Value::Null);

        let decoded = IdempotencyRecord::from_bytes(&completed.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.result, Some(serde_json::Value::Null));

        let processing = record(OperationStatus::Processing);
        let decoded = IdempotencyRecord::from_bytes(&processing.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.result, None);
    }
}
