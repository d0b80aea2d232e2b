//! Per-aggregate event ordering for projections.

use crate::event::EventEnvelope;
use crate::primitives::MAX_SEQUENCE_GAP;
use crate::{AggregateId, EvographError};
use std::collections::BTreeMap;

/// Releases each aggregate's events strictly in version order.
///
/// Events at or below the last committed version are duplicates and are
/// dropped. Events ahead of the next expected version wait in a buffer
/// until the gap closes; a gap wider than `MAX_SEQUENCE_GAP` is an error.
///
/// `offer` only hands events out. The consumer calls `commit` after each
/// event it applied and `requeue` for the ones it could not, so a failed
/// apply is retried on the next delivery instead of being skipped.
#[derive(Debug, Default)]
pub struct EventSequencer {
    released: BTreeMap<AggregateId, u64>,
    buffered: BTreeMap<AggregateId, BTreeMap<u64, EventEnvelope>>,
}

impl EventSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with already-applied versions.
    #[must_use]
    pub fn with_versions(released: BTreeMap<AggregateId, u64>) -> Self {
        Self {
            released,
            buffered: BTreeMap::new(),
        }
    }

    /// Last committed version per aggregate.
    #[must_use]
    pub fn versions(&self) -> &BTreeMap<AggregateId, u64> {
        &self.released
    }

    #[must_use]
    pub fn last_version(&self, aggregate_id: AggregateId) -> u64 {
        self.released.get(&aggregate_id).copied().unwrap_or(0)
    }

    /// Number of events waiting for a gap to close.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffered.values().map(BTreeMap::len).sum()
    }

    /// Offer one event. Returns the events that are now ready, in order,
    /// without committing them.
    pub fn offer(&mut self, event: EventEnvelope) -> Result<Vec<EventEnvelope>, EvographError> {
        let aggregate_id = event.aggregate_id;
        let last = self.last_version(aggregate_id);
        let version = event.aggregate_version;

        if version <= last {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                version,
                last,
                "duplicate event dropped"
            );
            return Ok(Vec::new());
        }

        if version > last + 1 {
            if version - last - 1 > MAX_SEQUENCE_GAP {
                return Err(EvographError::SequenceGap {
                    aggregate_id,
                    expected: last + 1,
                    received: version,
                });
            }
            self.buffered
                .entry(aggregate_id)
                .or_default()
                .entry(version)
                .or_insert(event);
            return Ok(Vec::new());
        }

        let mut ready = vec![event];
        let mut next = version + 1;
        if let Some(waiting) = self.buffered.get_mut(&aggregate_id) {
            // A requeued copy of this very event.
            waiting.remove(&version);
            while let Some(e) = waiting.remove(&next) {
                ready.push(e);
                next += 1;
            }
            if waiting.is_empty() {
                self.buffered.remove(&aggregate_id);
            }
        }
        Ok(ready)
    }

    /// Mark an offered event as applied.
    pub fn commit(&mut self, event: &EventEnvelope) {
        let last = self.released.entry(event.aggregate_id).or_insert(0);
        *last = (*last).max(event.aggregate_version);
    }

    /// Put offered but unapplied events back into the buffer.
    pub fn requeue(&mut self, events: impl IntoIterator<Item = EventEnvelope>) {
        for event in events {
            if event.aggregate_version <= self.last_version(event.aggregate_id) {
                continue;
            }
            self.buffered
                .entry(event.aggregate_id)
                .or_default()
                .entry(event.aggregate_version)
                .or_insert(event);
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.released.clear();
        self.buffered.clear();
    }
}
