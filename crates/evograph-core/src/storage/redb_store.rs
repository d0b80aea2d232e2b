//! # redb-backed Event Store
//!
//! A durable event log on the redb embedded database.
//!
//! - ACID: every append (and every import) is one write transaction
//! - Crash safety from redb's copy-on-write B-trees
//! - MVCC: readers never block the single writer
//!
//! Events and snapshots are stored as postcard records keyed by
//! `(aggregate_id, version)`. A second table maps global positions to
//! those keys for the commit-order feed.

use super::{EventStore, Snapshot, check_continues, validate_batch};
use crate::event::{ContentHash, EventEnvelope, NewEvent};
use crate::formats::{EventRecord, SnapshotRecord};
use crate::{AggregateId, EvographError};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Events: (aggregate_id, version) -> postcard `EventRecord`
const EVENTS: TableDefinition<(u128, u64), &[u8]> = TableDefinition::new("events");

/// Global feed: position -> (aggregate_id, version)
const POSITIONS: TableDefinition<u64, (u128, u64)> = TableDefinition::new("positions");

/// Stream heads: aggregate_id -> postcard `StreamHead`
const STREAMS: TableDefinition<u128, &[u8]> = TableDefinition::new("streams");

/// Snapshots: (aggregate_id, version) -> postcard `SnapshotRecord`
const SNAPSHOTS: TableDefinition<(u128, u64), &[u8]> = TableDefinition::new("snapshots");

/// Counters: key -> u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const LAST_POSITION: &str = "last_position";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamHead {
    aggregate_type: String,
    version: u64,
    hash: [u8; 32],
}

fn io_err(e: impl std::fmt::Display) -> EvographError {
    EvographError::IoError(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EvographError> {
    postcard::to_stdvec(value).map_err(|e| EvographError::SerializationError(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, EvographError> {
    postcard::from_bytes(bytes).map_err(|e| EvographError::DeserializationError(e.to_string()))
}

/// A durable event store.
pub struct RedbEventStore {
    db: Database,
}

impl std::fmt::Debug for RedbEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEventStore").finish_non_exhaustive()
    }
}

impl RedbEventStore {
    /// Open or create an event database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvographError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io_err)?;
            write_txn.open_table(EVENTS).map_err(io_err)?;
            write_txn.open_table(POSITIONS).map_err(io_err)?;
            write_txn.open_table(STREAMS).map_err(io_err)?;
            write_txn.open_table(SNAPSHOTS).map_err(io_err)?;
            write_txn.open_table(METADATA).map_err(io_err)?;
            write_txn.commit().map_err(io_err)?;
        }

        tracing::debug!(path = %path.as_ref().display(), "event database opened");
        Ok(Self { db })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), EvographError> {
        self.db.compact().map_err(io_err)?;
        Ok(())
    }

    fn stream_head(&self, aggregate_id: AggregateId) -> Result<Option<StreamHead>, EvographError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(STREAMS).map_err(io_err)?;
        table
            .get(aggregate_id.0.as_u128())
            .map_err(io_err)?
            .map(|guard| decode::<StreamHead>(guard.value()))
            .transpose()
    }

    fn read_head(
        streams: &redb::Table<'_, u128, &'static [u8]>,
        aggregate_id: AggregateId,
    ) -> Result<Option<StreamHead>, EvographError> {
        streams
            .get(aggregate_id.0.as_u128())
            .map_err(io_err)?
            .map(|guard| decode::<StreamHead>(guard.value()))
            .transpose()
    }

    fn put_event(
        events: &mut redb::Table<'_, (u128, u64), &'static [u8]>,
        positions: &mut redb::Table<'_, u64, (u128, u64)>,
        event: &EventEnvelope,
    ) -> Result<(), EvographError> {
        let key = (event.aggregate_id.0.as_u128(), event.aggregate_version);
        let bytes = encode(&EventRecord::from(event))?;
        events.insert(key, bytes.as_slice()).map_err(io_err)?;
        positions.insert(event.position, key).map_err(io_err)?;
        Ok(())
    }

    fn get_event(
        table: &impl ReadableTable<(u128, u64), &'static [u8]>,
        key: (u128, u64),
    ) -> Result<Option<EventEnvelope>, EvographError> {
        table
            .get(key)
            .map_err(io_err)?
            .map(|guard| decode::<EventRecord>(guard.value()).and_then(EventEnvelope::try_from))
            .transpose()
    }
}

fn type_mismatch(aggregate_id: AggregateId, stored: &str, given: &str) -> EvographError {
    EvographError::Validation(format!(
        "aggregate {} has type '{}', not '{}'",
        aggregate_id, stored, given
    ))
}

// =============================================================================
// EVENTSTORE TRAIT IMPLEMENTATION
// =============================================================================

impl EventStore for RedbEventStore {
    fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        validate_batch(aggregate_type, &events)?;

        let write_txn = self.db.begin_write().map_err(io_err)?;
        let sealed = {
            let mut streams = write_txn.open_table(STREAMS).map_err(io_err)?;
            let mut events_table = write_txn.open_table(EVENTS).map_err(io_err)?;
            let mut positions = write_txn.open_table(POSITIONS).map_err(io_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io_err)?;

            // The version check runs inside the write transaction, so
            // concurrent writers serialize on redb's single-writer lock.
            let head = Self::read_head(&streams, aggregate_id)?;
            let actual = head.as_ref().map(|h| h.version).unwrap_or(0);
            if actual != expected_version {
                return Err(EvographError::ConcurrencyConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }
            if let Some(h) = &head
                && h.aggregate_type != aggregate_type
            {
                return Err(type_mismatch(aggregate_id, &h.aggregate_type, aggregate_type));
            }

            let mut prev = head.map(|h| ContentHash(h.hash)).unwrap_or(ContentHash::GENESIS);
            let mut position = meta
                .get(LAST_POSITION)
                .map_err(io_err)?
                .map(|v| v.value())
                .unwrap_or(0);

            let mut sealed = Vec::with_capacity(events.len());
            for (event, version) in events.into_iter().zip(expected_version + 1..) {
                position += 1;
                let envelope =
                    EventEnvelope::seal(event, aggregate_id, aggregate_type, version, position, prev);
                prev = envelope.hash;
                Self::put_event(&mut events_table, &mut positions, &envelope)?;
                sealed.push(envelope);
            }

            let new_head = StreamHead {
                aggregate_type: aggregate_type.to_string(),
                version: expected_version + sealed.len() as u64,
                hash: prev.0,
            };
            streams
                .insert(aggregate_id.0.as_u128(), encode(&new_head)?.as_slice())
                .map_err(io_err)?;
            meta.insert(LAST_POSITION, position).map_err(io_err)?;
            sealed
        };
        write_txn.commit().map_err(io_err)?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            version = expected_version + sealed.len() as u64,
            count = sealed.len(),
            "events appended"
        );
        Ok(sealed)
    }

    fn load(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        if from_version == u64::MAX {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(EVENTS).map_err(io_err)?;
        let id = aggregate_id.0.as_u128();

        let mut events = Vec::new();
        for entry in table
            .range((id, from_version + 1)..=(id, u64::MAX))
            .map_err(io_err)?
        {
            let (_, value) = entry.map_err(io_err)?;
            let record: EventRecord = decode(value.value())?;
            events.push(EventEnvelope::try_from(record)?);
        }
        Ok(events)
    }

    fn current_version(&self, aggregate_id: AggregateId) -> Result<u64, EvographError> {
        Ok(self.stream_head(aggregate_id)?.map(|h| h.version).unwrap_or(0))
    }

    fn aggregate_type(&self, aggregate_id: AggregateId) -> Result<Option<String>, EvographError> {
        Ok(self.stream_head(aggregate_id)?.map(|h| h.aggregate_type))
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EvographError> {
        let bytes = encode(&SnapshotRecord::from(&snapshot))?;
        let write_txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS).map_err(io_err)?;
            table
                .insert(
                    (snapshot.aggregate_id.0.as_u128(), snapshot.version),
                    bytes.as_slice(),
                )
                .map_err(io_err)?;
        }
        write_txn.commit().map_err(io_err)?;
        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "snapshot saved"
        );
        Ok(())
    }

    fn latest_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EvographError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(SNAPSHOTS).map_err(io_err)?;
        let id = aggregate_id.0.as_u128();

        let Some(entry) = table
            .range((id, 0)..=(id, u64::MAX))
            .map_err(io_err)?
            .next_back()
        else {
            return Ok(None);
        };
        let (_, value) = entry.map_err(io_err)?;
        let record: SnapshotRecord = decode(value.value())?;
        Snapshot::try_from(record).map(Some)
    }

    fn read_all(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        if after_position == u64::MAX || limit == 0 {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let positions = read_txn.open_table(POSITIONS).map_err(io_err)?;
        let events = read_txn.open_table(EVENTS).map_err(io_err)?;

        let mut out = Vec::new();
        for entry in positions.range(after_position + 1..).map_err(io_err)?.take(limit) {
            let (position, key) = entry.map_err(io_err)?;
            let key = key.value();
            let event = Self::get_event(&events, key)?.ok_or_else(|| {
                EvographError::IoError(format!(
                    "position {} points at a missing event",
                    position.value()
                ))
            })?;
            out.push(event);
        }
        Ok(out)
    }

    fn last_position(&self) -> Result<u64, EvographError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(METADATA).map_err(io_err)?;
        Ok(table
            .get(LAST_POSITION)
            .map_err(io_err)?
            .map(|v| v.value())
            .unwrap_or(0))
    }

    fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EvographError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(STREAMS).map_err(io_err)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (key, _) = entry.map_err(io_err)?;
            ids.push(AggregateId(uuid::Uuid::from_u128(key.value())));
        }
        Ok(ids)
    }

    fn event_count(&self) -> Result<u64, EvographError> {
        // Every stored event owns exactly one position.
        self.last_position()
    }

    fn import(&self, events: Vec<EventEnvelope>) -> Result<usize, EvographError> {
        let count = events.len();
        let write_txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut streams = write_txn.open_table(STREAMS).map_err(io_err)?;
            let mut events_table = write_txn.open_table(EVENTS).map_err(io_err)?;
            let mut positions = write_txn.open_table(POSITIONS).map_err(io_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io_err)?;

            let mut position = meta
                .get(LAST_POSITION)
                .map_err(io_err)?
                .map(|v| v.value())
                .unwrap_or(0);

            for mut event in events {
                let head = Self::read_head(&streams, event.aggregate_id)?;
                let (version, hash) = match &head {
                    Some(h) if h.aggregate_type != event.aggregate_type => {
                        return Err(type_mismatch(
                            event.aggregate_id,
                            &h.aggregate_type,
                            &event.aggregate_type,
                        ));
                    }
                    Some(h) => (h.version, ContentHash(h.hash)),
                    None => (0, ContentHash::GENESIS),
                };
                check_continues(&event, version, hash)?;

                position += 1;
                event.position = position;
                Self::put_event(&mut events_table, &mut positions, &event)?;

                let new_head = StreamHead {
                    aggregate_type: event.aggregate_type.clone(),
                    version: event.aggregate_version,
                    hash: event.hash.0,
                };
                streams
                    .insert(event.aggregate_id.0.as_u128(), encode(&new_head)?.as_slice())
                    .map_err(io_err)?;
            }
            meta.insert(LAST_POSITION, position).map_err(io_err)?;
        }
        write_txn.commit().map_err(io_err)?;

        tracing::debug!(count, "events imported");
        Ok(count)
    }
}

// =============================================================================
// TESTS
// =============================================================================
