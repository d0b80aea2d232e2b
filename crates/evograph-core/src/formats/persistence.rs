//! # Persistence Format
//!
//! Binary serialization of events and snapshots.
//!
//! Archive format: Header (5 bytes) + postcard-serialized event list.
//! - 4 bytes: Magic ("EVOG")
//! - 1 byte: Version
//!
//! Archives are pure byte transformations; file I/O lives in the app layer.
//!
//! ## Limits
//!
//! Size and header are validated before any payload is decoded, so a
//! corrupted or hostile archive cannot force a large allocation.

use crate::event::{ContentHash, EventEnvelope};
use crate::primitives::{DEFAULT_CATCH_UP_BATCH, FORMAT_VERSION, MAGIC_BYTES};
use crate::storage::{EventStore, Snapshot};
use crate::{AggregateId, CausationId, CorrelationId, EventId, EvographError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted archive size (500 MB).
pub const MAX_ARCHIVE_SIZE: usize = 500 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// RECORDS
// =============================================================================

/// Storage form of an `EventEnvelope`.
///
/// postcard cannot decode self-describing values, so the JSON payload is
/// kept as text. The text is exactly what the hash was computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_version: u64,
    pub payload: String,
    pub timestamp_ms: i64,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub position: u64,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl From<&EventEnvelope> for EventRecord {
    fn from(event: &EventEnvelope) -> Self {
        Self {
            event_id: event.event_id.0,
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.0,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_version: event.aggregate_version,
            payload: event.payload.to_string(),
            timestamp_ms: event.timestamp.timestamp_millis(),
            correlation_id: event.correlation_id.map(|c| c.0),
            causation_id: event.causation_id.map(|c| c.0),
            position: event.position,
            prev_hash: event.prev_hash.0,
            hash: event.hash.0,
        }
    }
}

impl TryFrom<EventRecord> for EventEnvelope {
    type Error = EvographError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&record.payload)
            .map_err(|e| EvographError::DeserializationError(e.to_string()))?;
        Ok(Self {
            event_id: EventId(record.event_id),
            event_type: record.event_type,
            aggregate_id: AggregateId(record.aggregate_id),
            aggregate_type: record.aggregate_type,
            aggregate_version: record.aggregate_version,
            payload,
            timestamp: timestamp_from_millis(record.timestamp_ms)?,
            correlation_id: record.correlation_id.map(CorrelationId),
            causation_id: record.causation_id.map(CausationId),
            position: record.position,
            prev_hash: ContentHash(record.prev_hash),
            hash: ContentHash(record.hash),
        })
    }
}

/// Storage form of a `Snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: u64,
    pub state: String,
    pub taken_at_ms: i64,
}

impl From<&Snapshot> for SnapshotRecord {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            aggregate_id: snapshot.aggregate_id.0,
            aggregate_type: snapshot.aggregate_type.clone(),
            version: snapshot.version,
            state: snapshot.state.to_string(),
            taken_at_ms: snapshot.taken_at.timestamp_millis(),
        }
    }
}

impl TryFrom<SnapshotRecord> for Snapshot {
    type Error = EvographError;

    fn try_from(record: SnapshotRecord) -> Result<Self, Self::Error> {
        let state = serde_json::from_str(&record.state)
            .map_err(|e| EvographError::DeserializationError(e.to_string()))?;
        Ok(Self {
            aggregate_id: AggregateId(record.aggregate_id),
            aggregate_type: record.aggregate_type,
            version: record.version,
            state,
            taken_at: timestamp_from_millis(record.taken_at_ms)?,
        })
    }
}

fn timestamp_from_millis(ms: i64) -> Result<DateTime<Utc>, EvographError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        EvographError::DeserializationError(format!("timestamp out of range: {}", ms))
    })
}

// =============================================================================
// ARCHIVE HEADER
// =============================================================================

/// The header that precedes every archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl ArchiveHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), EvographError> {
        if &self.magic != MAGIC_BYTES {
            return Err(EvographError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(EvographError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EvographError> {
        let Some(header) = bytes.get(..HEADER_LEN) else {
            return Err(EvographError::DeserializationError(
                "Header too short".to_string(),
            ));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        Ok(Self {
            magic,
            version: header[4],
        })
    }
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ARCHIVE ENCODING
// =============================================================================

/// Encode events (in commit order) as an archive.
pub fn archive_to_bytes(events: &[EventEnvelope]) -> Result<Vec<u8>, EvographError> {
    let records: Vec<EventRecord> = events.iter().map(EventRecord::from).collect();
    let payload = postcard::to_stdvec(&records)
        .map_err(|e| EvographError::SerializationError(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&ArchiveHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode an archive back into events.
///
/// Validates size and header before decoding the payload.
pub fn archive_from_bytes(bytes: &[u8]) -> Result<Vec<EventEnvelope>, EvographError> {
    if bytes.len() > MAX_ARCHIVE_SIZE {
        return Err(EvographError::DeserializationError(format!(
            "Archive size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_ARCHIVE_SIZE
        )));
    }
    ArchiveHeader::from_bytes(bytes)?.validate()?;

    let records: Vec<EventRecord> = postcard::from_bytes(&bytes[HEADER_LEN..])
        .map_err(|e| EvographError::DeserializationError(format!("Corrupt archive: {}", e)))?;
    records.into_iter().map(EventEnvelope::try_from).collect()
}

/// Export the whole log of a store, in commit order.
pub fn export_store(store: &dyn EventStore) -> Result<Vec<u8>, EvographError> {
    let mut events = Vec::new();
    let mut cursor = 0;
    loop {
        let page = store.read_all(cursor, DEFAULT_CATCH_UP_BATCH)?;
        let Some(last) = page.last() else { break };
        cursor = last.position;
        events.extend(page);
    }
    tracing::debug!(count = events.len(), "log exported");
    archive_to_bytes(&events)
}

/// Import an archive into a store. Returns the number of events imported.
pub fn import_store(store: &dyn EventStore, bytes: &[u8]) -> Result<usize, EvographError> {
    let events = archive_from_bytes(bytes)?;
    store.import(events)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, NewEvent};
    use crate::storage::InMemoryEventStore;
    use serde_json::json;

    fn populated() -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store
            .append(a, "graph", 0, vec![NewEvent::new("A1", json!({ "x": 1 }))])
            .expect("append");
        store
            .append(
                b,
                "graph",
                0,
                vec![
                    NewEvent::new("B1", json!([1.5, "two"]))
                        .with_metadata(EventMetadata::new().with_correlation(CorrelationId::new())),
                ],
            )
            .expect("append");
        store
            .append(a, "graph", 1, vec![NewEvent::new("A2", json!(null))])
            .expect("append");
        store
    }

    #[test]
    fn header_roundtrip() {
        let bytes = ArchiveHeader::new().to_bytes();
        let restored = ArchiveHeader::from_bytes(&bytes).expect("parse header");
        assert_eq!(restored, ArchiveHeader::new());
    }

    #[test]
    fn archive_roundtrip_is_bit_exact() {
        let store = populated();
        let bytes = export_store(&store).expect("export");
        let events = archive_from_bytes(&bytes).expect("decode");
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.compute_hash() == e.hash));
        assert_eq!(archive_to_bytes(&events).expect("encode"), bytes);
    }

    #[test]
    fn import_into_empty_store() {
        let bytes = export_store(&populated()).expect("export");
        let target = InMemoryEventStore::new();
        assert_eq!(import_store(&target, &bytes).expect("import"), 3);
        assert_eq!(target.event_count().expect("count"), 3);
        assert_eq!(target.aggregate_ids().expect("ids").len(), 2);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = vec![0u8; 10];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(archive_from_bytes(&bytes).is_err());
    }

    #[test]
    fn truncated_archive_rejected() {
        assert!(archive_from_bytes(b"EVO").is_err());
        let bytes = export_store(&populated()).expect("export");
        assert!(archive_from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
