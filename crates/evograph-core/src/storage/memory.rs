//! Volatile event store backed by `parking_lot::RwLock`.

use super::{EventStore, Snapshot, check_continues, validate_batch};
use crate::event::{ContentHash, EventEnvelope, NewEvent};
use crate::{AggregateId, EvographError};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Stream {
    aggregate_type: String,
    /// Indexes into `Inner::log`, in version order.
    entries: Vec<usize>,
    head: ContentHash,
}

#[derive(Debug, Default)]
struct Inner {
    /// Global commit order; position `n` lives at index `n - 1`.
    log: Vec<EventEnvelope>,
    streams: BTreeMap<AggregateId, Stream>,
    snapshots: BTreeMap<(AggregateId, u64), Snapshot>,
}

impl Inner {
    fn version_of(&self, id: AggregateId) -> u64 {
        self.streams
            .get(&id)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0)
    }

    fn push(&mut self, mut event: EventEnvelope, aggregate_type: &str) {
        event.position = self.log.len() as u64 + 1;
        let stream = self
            .streams
            .entry(event.aggregate_id)
            .or_insert_with(|| Stream {
                aggregate_type: aggregate_type.to_string(),
                entries: Vec::new(),
                head: ContentHash::GENESIS,
            });
        stream.entries.push(self.log.len());
        stream.head = event.hash;
        self.log.push(event);
    }
}

/// In-memory event store.
///
/// Every operation takes the lock once, so an append is atomic with
/// respect to concurrent readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        validate_batch(aggregate_type, &events)?;

        let mut inner = self.inner.write();
        let actual = inner.version_of(aggregate_id);
        if actual != expected_version {
            return Err(EvographError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }
        if let Some(stream) = inner.streams.get(&aggregate_id)
            && stream.aggregate_type != aggregate_type
        {
            return Err(EvographError::Validation(format!(
                "aggregate {} has type '{}', not '{}'",
                aggregate_id, stream.aggregate_type, aggregate_type
            )));
        }

        let mut head = inner
            .streams
            .get(&aggregate_id)
            .map(|s| s.head)
            .unwrap_or(ContentHash::GENESIS);
        let mut position = inner.log.len() as u64;
        let sealed: Vec<EventEnvelope> = events
            .into_iter()
            .zip(expected_version + 1..)
            .map(|(event, version)| {
                position += 1;
                let envelope = EventEnvelope::seal(
                    event,
                    aggregate_id,
                    aggregate_type,
                    version,
                    position,
                    head,
                );
                head = envelope.hash;
                envelope
            })
            .collect();

        for event in &sealed {
            inner.push(event.clone(), aggregate_type);
        }

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
        let inner = self.inner.read();
        let Some(stream) = inner.streams.get(&aggregate_id) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .skip(from_version as usize)
            .filter_map(|&i| inner.log.get(i).cloned())
            .collect())
    }

    fn current_version(&self, aggregate_id: AggregateId) -> Result<u64, EvographError> {
        Ok(self.inner.read().version_of(aggregate_id))
    }

    fn aggregate_type(&self, aggregate_id: AggregateId) -> Result<Option<String>, EvographError> {
        Ok(self
            .inner
            .read()
            .streams
            .get(&aggregate_id)
            .map(|s| s.aggregate_type.clone()))
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EvographError> {
        self.inner
            .write()
            .snapshots
            .insert((snapshot.aggregate_id, snapshot.version), snapshot);
        Ok(())
    }

    fn latest_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EvographError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .range((aggregate_id, 0)..=(aggregate_id, u64::MAX))
            .next_back()
            .map(|(_, s)| s.clone()))
    }

    fn read_all(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        let inner = self.inner.read();
        Ok(inner
            .log
            .iter()
            .skip(after_position as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn last_position(&self) -> Result<u64, EvographError> {
        Ok(self.inner.read().log.len() as u64)
    }

    fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EvographError> {
        Ok(self.inner.read().streams.keys().copied().collect())
    }

    fn event_count(&self) -> Result<u64, EvographError> {
        Ok(self.inner.read().log.len() as u64)
    }

    fn import(&self, events: Vec<EventEnvelope>) -> Result<usize, EvographError> {
        let mut inner = self.inner.write();

        // Validate the whole batch against a projected view of stream heads
        // before touching the log.
        let mut heads: BTreeMap<AggregateId, (u64, ContentHash, String)> = BTreeMap::new();
        for event in &events {
            let (version, hash, aggregate_type) = match heads.get(&event.aggregate_id) {
                Some(head) => head.clone(),
                None => match inner.streams.get(&event.aggregate_id) {
                    Some(s) => (s.entries.len() as u64, s.head, s.aggregate_type.clone()),
                    None => (0, ContentHash::GENESIS, event.aggregate_type.clone()),
                },
            };
            if aggregate_type != event.aggregate_type {
                return Err(EvographError::Validation(format!(
                    "aggregate {} has type '{}', not '{}'",
                    event.aggregate_id, aggregate_type, event.aggregate_type
                )));
            }
            check_continues(event, version, hash)?;
            heads.insert(
                event.aggregate_id,
                (event.aggregate_version, event.hash, aggregate_type),
            );
        }

        let count = events.len();
        for event in events {
            let aggregate_type = event.aggregate_type.clone();
            inner.push(event, &aggregate_type);
        }
        tracing::debug!(count, "events imported");
        Ok(count)
    }
}
