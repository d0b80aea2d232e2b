//! # Events
//!
//! The immutable record of every accepted transition.
//!
//! An `EventEnvelope` is what the log stores and what consumers read. It
//! carries the JSON payload produced by the aggregate, the causal metadata
//! supplied by the caller, and a per-aggregate BLAKE3 hash chain that makes
//! tampering with stored history detectable.

use crate::{AggregateId, CausationId, CorrelationId, EventId, EvographError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// =============================================================================
// CONTENT HASH
// =============================================================================

/// A 32-byte BLAKE3 digest, rendered as lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// The `prev_hash` of the first event of every aggregate.
    pub const GENESIS: Self = Self([0u8; 32]);

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, EvographError> {
        blake3::Hash::from_hex(s)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| EvographError::DeserializationError(format!("invalid hash: {}", e)))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// METADATA
// =============================================================================

/// Causal metadata supplied with a command and copied onto its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<CausationId>,
}

impl EventMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_causation(mut self, id: CausationId) -> Self {
        self.causation_id = Some(id);
        self
    }
}

// =============================================================================
// NEW EVENT
// =============================================================================

/// An event that has been decided but not yet appended.
///
/// The store assigns id, version, position, timestamp and hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

impl NewEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Serialize a typed domain event into a new event.
    pub fn from_typed<T: Serialize>(
        event_type: impl Into<String>,
        event: &T,
    ) -> Result<Self, EvographError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EvographError::SerializationError(e.to_string()))?;
        Ok(Self::new(event_type, payload))
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// EVENT ENVELOPE
// =============================================================================

/// A stored, immutable event.
///
/// Wire-compatible with the event envelope JSON object: `type`,
/// `aggregate_id`, `payload`, optional `correlation_id`/`causation_id`,
/// plus `event_id`, `aggregate_version` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub aggregate_version: u64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<CausationId>,
    /// Global commit sequence within one store, starting at 1.
    pub position: u64,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

impl EventEnvelope {
    /// Seal a new event: assign identity and chain it onto `prev_hash`.
    #[must_use]
    pub fn seal(
        event: NewEvent,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        aggregate_version: u64,
        position: u64,
        prev_hash: ContentHash,
    ) -> Self {
        let mut envelope = Self {
            event_id: EventId::new(),
            event_type: event.event_type,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            aggregate_version,
            payload: event.payload,
            timestamp: now_millis(),
            correlation_id: event.metadata.correlation_id,
            causation_id: event.metadata.causation_id,
            position,
            prev_hash,
            hash: ContentHash::GENESIS,
        };
        envelope.hash = envelope.compute_hash();
        envelope
    }

    /// Causal metadata of this event.
    #[must_use]
    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
        }
    }

    /// Decode the payload into a typed domain event.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EvographError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EvographError::DeserializationError(e.to_string()))
    }

    /// Recompute the content hash from the event's fields.
    ///
    /// Covers identity, ordering, type, payload, timestamp, causal metadata
    /// and the previous hash. `position` is excluded: it is assigned by the
    /// store that commits the event and may differ after an import.
    #[must_use]
    pub fn compute_hash(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_hash.0.as_slice());
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.aggregate_id.as_bytes());
        hash_str(&mut hasher, &self.aggregate_type);
        hasher.update(&self.aggregate_version.to_le_bytes());
        hash_str(&mut hasher, &self.event_type);
        hash_str(&mut hasher, &self.payload.to_string());
        hasher.update(&self.timestamp.timestamp_millis().to_le_bytes());
        for id in [
            self.correlation_id.map(|c| c.0),
            self.causation_id.map(|c| c.0),
        ] {
            match id {
                Some(uuid) => {
                    hasher.update(&[1]);
                    hasher.update(uuid.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        ContentHash(*hasher.finalize().as_bytes())
    }
}

/// Length-prefixed so adjacent strings cannot run into each other.
fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Current time truncated to millisecond precision, so timestamps survive
/// a round trip through RFC 3339 text and the storage encoding unchanged.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// =============================================================================
// CHAIN VERIFICATION
// =============================================================================

/// Result of verifying one aggregate's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub length: u64,
    /// Version of the first event that failed verification.
    pub first_invalid: Option<u64>,
    pub error: Option<String>,
}

impl ChainVerification {
    fn invalid(length: u64, version: u64, error: String) -> Self {
        Self {
            is_valid: false,
            length,
            first_invalid: Some(version),
            error: Some(error),
        }
    }
}

/// Verify the events of a single aggregate, in version order from 1.
///
/// Checks, for each event:
/// 1. versions are contiguous starting at 1
/// 2. `prev_hash` links to the previous event's hash (genesis for the first)
/// 3. the stored hash matches the recomputed hash
pub fn verify_chain(events: &[EventEnvelope]) -> ChainVerification {
    let length = events.len() as u64;
    let mut prev_hash = ContentHash::GENESIS;

    for (expected_version, event) in (1u64..).zip(events) {
        if event.aggregate_version != expected_version {
            return ChainVerification::invalid(
                length,
                event.aggregate_version,
                format!(
                    "version gap: expected {}, found {}",
                    expected_version, event.aggregate_version
                ),
            );
        }
        if event.prev_hash != prev_hash {
            return ChainVerification::invalid(
                length,
                expected_version,
                format!("prev_hash mismatch at version {}", expected_version),
            );
        }
        if event.compute_hash() != event.hash {
            return ChainVerification::invalid(
                length,
                expected_version,
                format!("hash mismatch at version {}", expected_version),
            );
        }
        prev_hash = event.hash;
    }

    ChainVerification {
        is_valid: true,
        length,
        first_invalid: None,
        error: None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
