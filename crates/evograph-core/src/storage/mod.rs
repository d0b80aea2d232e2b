//! # Event Log Storage
//!
//! The append-only, per-aggregate ordered log that is the single source of
//! truth of the engine, plus the snapshots used to shorten replay.
//!
//! Two backends share the `EventStore` contract:
//! - `InMemoryEventStore`: volatile, for tests and ephemeral engines
//! - `RedbEventStore`: durable, one redb write transaction per append
//!
//! Appends are all-or-nothing and guarded by optimistic versioning: the
//! caller states the version it observed, and the store refuses the append
//! if another writer got there first.

mod memory;
mod redb_store;

pub use memory::InMemoryEventStore;
pub use redb_store::RedbEventStore;

use crate::event::{ContentHash, EventEnvelope, NewEvent};
use crate::primitives::{MAX_APPEND_BATCH, MAX_LABEL_LENGTH, MAX_PAYLOAD_SIZE};
use crate::{AggregateId, CausationId, EvographError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Serialized aggregate state at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

// =============================================================================
// EVENT STORE TRAIT
// =============================================================================

/// Append-only event log with snapshots.
///
/// Implementations use interior locking so that a store can be shared
/// between writers and projection consumers behind an `Arc`.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate's stream.
    ///
    /// Fails with `ConcurrencyConflict` when the stored version is not
    /// `expected_version`. Either every event is stored or none is.
    fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EvographError>;

    /// Events with version greater than `from_version`, in version order.
    fn load(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EvographError>;

    /// Current version of the aggregate, 0 if it has no events.
    fn current_version(&self, aggregate_id: AggregateId) -> Result<u64, EvographError>;

    /// Type recorded by the first append, `None` for unknown aggregates.
    fn aggregate_type(&self, aggregate_id: AggregateId) -> Result<Option<String>, EvographError>;

    /// Store a snapshot. A later snapshot for the same version replaces it.
    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EvographError>;

    /// Snapshot with the highest version, if any.
    fn latest_snapshot(&self, aggregate_id: AggregateId)
    -> Result<Option<Snapshot>, EvographError>;

    /// Up to `limit` events with position greater than `after_position`, in
    /// global commit order.
    fn read_all(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EvographError>;

    /// Position of the most recently committed event, 0 for an empty log.
    fn last_position(&self) -> Result<u64, EvographError>;

    /// Every aggregate with at least one event, in id order.
    fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EvographError>;

    /// Total number of stored events.
    fn event_count(&self) -> Result<u64, EvographError>;

    /// Store already-sealed events, preserving ids, timestamps and hashes.
    ///
    /// Used to restore an archive. Events are re-positioned in the order
    /// given; each must continue its aggregate's chain.
    fn import(&self, events: Vec<EventEnvelope>) -> Result<usize, EvographError>;

    /// Events of an aggregate caused by the given command.
    fn find_by_causation(
        &self,
        aggregate_id: AggregateId,
        causation_id: CausationId,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        Ok(self
            .load(aggregate_id, 0)?
            .into_iter()
            .filter(|e| e.causation_id == Some(causation_id))
            .collect())
    }
}

impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        (**self).append(aggregate_id, aggregate_type, expected_version, events)
    }

    fn load(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        (**self).load(aggregate_id, from_version)
    }

    fn current_version(&self, aggregate_id: AggregateId) -> Result<u64, EvographError> {
        (**self).current_version(aggregate_id)
    }

    fn aggregate_type(&self, aggregate_id: AggregateId) -> Result<Option<String>, EvographError> {
        (**self).aggregate_type(aggregate_id)
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EvographError> {
        (**self).save_snapshot(snapshot)
    }

    fn latest_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EvographError> {
        (**self).latest_snapshot(aggregate_id)
    }

    fn read_all(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        (**self).read_all(after_position, limit)
    }

    fn last_position(&self) -> Result<u64, EvographError> {
        (**self).last_position()
    }

    fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EvographError> {
        (**self).aggregate_ids()
    }

    fn event_count(&self) -> Result<u64, EvographError> {
        (**self).event_count()
    }

    fn import(&self, events: Vec<EventEnvelope>) -> Result<usize, EvographError> {
        (**self).import(events)
    }

    fn find_by_causation(
        &self,
        aggregate_id: AggregateId,
        causation_id: CausationId,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        (**self).find_by_causation(aggregate_id, causation_id)
    }
}

// =============================================================================
// SHARED VALIDATION
// =============================================================================

/// Reject malformed batches before any lock or transaction is taken.
pub(crate) fn validate_batch(aggregate_type: &str, events: &[NewEvent]) -> Result<(), EvographError> {
    validate_label("aggregate type", aggregate_type)?;
    if events.is_empty() {
        return Err(EvographError::Validation(
            "append requires at least one event".to_string(),
        ));
    }
    if events.len() > MAX_APPEND_BATCH {
        return Err(EvographError::Validation(format!(
            "append batch of {} exceeds limit {}",
            events.len(),
            MAX_APPEND_BATCH
        )));
    }
    for event in events {
        validate_label("event type", &event.event_type)?;
        let size = event.payload.to_string().len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(EvographError::Validation(format!(
                "payload of {} bytes exceeds limit {}",
                size, MAX_PAYLOAD_SIZE
            )));
        }
    }
    Ok(())
}

fn validate_label(what: &str, value: &str) -> Result<(), EvographError> {
    if value.is_empty() || value.len() > MAX_LABEL_LENGTH {
        return Err(EvographError::Validation(format!(
            "{} must be 1..={} bytes",
            what, MAX_LABEL_LENGTH
        )));
    }
    Ok(())
}

/// Check that an imported event continues the stream whose head is
/// `(version, hash)` and that its own hash is intact.
pub(crate) fn check_continues(
    event: &EventEnvelope,
    head_version: u64,
    head_hash: ContentHash,
) -> Result<(), EvographError> {
    let expected = head_version.saturating_add(1);
    if event.aggregate_version != expected {
        return Err(EvographError::ConcurrencyConflict {
            aggregate_id: event.aggregate_id,
            expected,
            actual: event.aggregate_version,
        });
    }
    if event.prev_hash != head_hash || event.compute_hash() != event.hash {
        return Err(EvographError::Validation(format!(
            "event {} of aggregate {} breaks the hash chain",
            event.aggregate_version, event.aggregate_id
        )));
    }
    Ok(())
}

// =============================================================================
// CONTRACT TESTS (run against every backend)
// =============================================================================

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::event::{EventMetadata, verify_chain};
    use serde_json::json;

    fn one(kind: &str) -> Vec<NewEvent> {
        vec![NewEvent::new(kind, json!({ "kind": kind }))]
    }

    pub fn append_and_load(store: &dyn EventStore) {
        let id = AggregateId::new();
        assert_eq!(store.current_version(id).expect("version"), 0);

        let first = store
            .append(id, "graph", 0, one("Created"))
            .expect("first append");
        assert_eq!(first[0].aggregate_version, 1);
        assert_eq!(first[0].prev_hash, ContentHash::GENESIS);

        let more = store
            .append(
                id,
                "graph",
                1,
                vec![
                    NewEvent::new("A", json!(1)),
                    NewEvent::new("B", json!(2)),
                ],
            )
            .expect("second append");
        assert_eq!(more[1].aggregate_version, 3);
        assert_eq!(store.current_version(id).expect("version"), 3);

        let tail = store.load(id, 1).expect("load");
        assert_eq!(
            tail.iter().map(|e| e.aggregate_version).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(verify_chain(&store.load(id, 0).expect("load")).is_valid);
        assert_eq!(store.aggregate_type(id).expect("type").as_deref(), Some("graph"));
    }

    pub fn stale_version_conflicts(store: &dyn EventStore) {
        let id = AggregateId::new();
        store.append(id, "graph", 0, one("Created")).expect("append");

        let err = store
            .append(id, "graph", 0, one("Again"))
            .expect_err("stale append must fail");
        assert_eq!(
            err,
            EvographError::ConcurrencyConflict {
                aggregate_id: id,
                expected: 0,
                actual: 1,
            }
        );
        assert_eq!(store.current_version(id).expect("version"), 1);
    }

    pub fn type_is_fixed(store: &dyn EventStore) {
        let id = AggregateId::new();
        store.append(id, "graph", 0, one("Created")).expect("append");
        assert!(store.append(id, "other", 1, one("X")).is_err());
    }

    pub fn global_feed_orders_commits(store: &dyn EventStore) {
        let a = AggregateId::new();
        let b = AggregateId::new();
        let start = store.last_position().expect("position");
        store.append(a, "graph", 0, one("A1")).expect("append");
        store.append(b, "graph", 0, one("B1")).expect("append");
        store.append(a, "graph", 1, one("A2")).expect("append");

        let feed = store.read_all(start, 10).expect("read_all");
        let types: Vec<_> = feed.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["A1", "B1", "A2"]);
        assert!(feed.windows(2).all(|w| w[0].position < w[1].position));

        let page = store.read_all(start, 2).expect("read_all");
        assert_eq!(page.len(), 2);
        let rest = store.read_all(page[1].position, 10).expect("read_all");
        assert_eq!(rest.len(), 1);
        assert_eq!(store.last_position().expect("position"), start + 3);
    }

    pub fn snapshots_latest_wins(store: &dyn EventStore) {
        let id = AggregateId::new();
        assert!(store.latest_snapshot(id).expect("snapshot").is_none());
        for version in [5, 10, 7] {
            store
                .save_snapshot(Snapshot {
                    aggregate_id: id,
                    aggregate_type: "graph".into(),
                    version,
                    state: json!({ "v": version }),
                    taken_at: Utc::now(),
                })
                .expect("save");
        }
        let latest = store.latest_snapshot(id).expect("snapshot").expect("some");
        assert_eq!(latest.version, 10);
    }

    pub fn causation_lookup(store: &dyn EventStore) {
        let id = AggregateId::new();
        let cause = CausationId::new();
        store.append(id, "graph", 0, one("Created")).expect("append");
        store
            .append(
                id,
                "graph",
                1,
                vec![
                    NewEvent::new("Caused", json!(null))
                        .with_metadata(EventMetadata::new().with_causation(cause)),
                ],
            )
            .expect("append");

        let found = store.find_by_causation(id, cause).expect("lookup");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].aggregate_version, 2);
    }

    pub fn empty_batch_rejected(store: &dyn EventStore) {
        let err = store
            .append(AggregateId::new(), "graph", 0, Vec::new())
            .expect_err("empty batch");
        assert!(matches!(err, EvographError::Validation(_)));
    }

    pub fn import_preserves_chain(source: &dyn EventStore, target: &dyn EventStore) {
        let id = AggregateId::new();
        source.append(id, "graph", 0, one("A")).expect("append");
        source.append(id, "graph", 1, one("B")).expect("append");
        let events = source.load(id, 0).expect("load");

        assert_eq!(target.import(events.clone()).expect("import"), 2);
        let copied = target.load(id, 0).expect("load");
        assert_eq!(copied.len(), 2);
        assert_eq!(copied[1].hash, events[1].hash);
        assert!(verify_chain(&copied).is_valid);

        // Importing the same events again must not fork the stream.
        assert!(target.import(events).is_err());
    }
}
