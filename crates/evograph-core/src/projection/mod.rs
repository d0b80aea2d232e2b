//! # Projection Engine
//!
//! Read models derived from the event log. A projection only folds events;
//! the [`ProjectionRunner`] around it supplies idempotency, per-aggregate
//! ordering and a checkpointed cursor into the global feed.
//!
//! Projections are never authoritative. `rebuild` discards one and replays
//! the log from position 0, converging to the same state as incremental
//! application.

mod conceptual;
mod sequencer;
mod summary;

pub use conceptual::ConceptualProjection;
pub use sequencer::EventSequencer;
pub use summary::{GraphSummary, GraphSummaryProjection};

use crate::event::EventEnvelope;
use crate::primitives::DEFAULT_CATCH_UP_BATCH;
use crate::storage::EventStore;
use crate::{AggregateId, EvographError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A read model fed by stored events.
pub trait Projection: Send {
    /// Stable name, used in checkpoints and logs.
    fn name(&self) -> &str;

    /// Fold one event. Called at most once per `(aggregate, version)`, in
    /// version order per aggregate.
    fn apply(&mut self, event: &EventEnvelope) -> Result<(), EvographError>;

    /// Drop all derived state.
    fn reset(&mut self);
}

/// Where a projection stands in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    pub name: String,
    /// Highest global position consumed.
    pub position: u64,
    /// Last applied version per aggregate.
    pub versions: BTreeMap<AggregateId, u64>,
}

/// Drives a projection from the event log.
#[derive(Debug)]
pub struct ProjectionRunner<P> {
    projection: P,
    sequencer: EventSequencer,
    position: u64,
}

impl<P: Projection> ProjectionRunner<P> {
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            sequencer: EventSequencer::new(),
            position: 0,
        }
    }

    /// Continue from a saved checkpoint. `projection` must already hold the
    /// state that checkpoint describes.
    pub fn resume(projection: P, checkpoint: ProjectionCheckpoint) -> Result<Self, EvographError> {
        if checkpoint.name != projection.name() {
            return Err(EvographError::Validation(format!(
                "checkpoint of '{}' cannot resume '{}'",
                checkpoint.name,
                projection.name()
            )));
        }
        Ok(Self {
            projection,
            sequencer: EventSequencer::with_versions(checkpoint.versions),
            position: checkpoint.position,
        })
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Events buffered behind a version gap.
    pub fn pending(&self) -> usize {
        self.sequencer.pending()
    }

    pub fn checkpoint(&self) -> ProjectionCheckpoint {
        ProjectionCheckpoint {
            name: self.projection.name().to_string(),
            position: self.position,
            versions: self.sequencer.versions().clone(),
        }
    }

    /// Offer one event. Returns how many events were applied, which can
    /// be 0 (duplicate or buffered) or more than 1 (a gap closed).
    ///
    /// If an apply fails, that event and everything released after it go
    /// back to the sequencer and the cursor stays put.
    pub fn handle(&mut self, event: EventEnvelope) -> Result<usize, EvographError> {
        let position = event.position;
        let ready = self.sequencer.offer(event)?;
        let mut applied = 0;
        let mut ready = ready.into_iter();
        while let Some(e) = ready.next() {
            if let Err(err) = self.projection.apply(&e) {
                tracing::warn!(
                    projection = self.projection.name(),
                    aggregate_id = %e.aggregate_id,
                    version = e.aggregate_version,
                    error = %err,
                    "projection apply failed"
                );
                self.sequencer.requeue(std::iter::once(e).chain(ready));
                return Err(err);
            }
            self.sequencer.commit(&e);
            applied += 1;
        }
        self.position = self.position.max(position);
        Ok(applied)
    }

    /// Offer events in the order given.
    pub fn apply_batch(
        &mut self,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> Result<usize, EvographError> {
        let mut applied = 0;
        for event in events {
            applied += self.handle(event)?;
        }
        Ok(applied)
    }

    /// Pull everything after the cursor, `batch_size` events at a time.
    pub fn catch_up(
        &mut self,
        store: &dyn EventStore,
        batch_size: usize,
    ) -> Result<usize, EvographError> {
        let batch_size = batch_size.max(1);
        let mut applied = 0;
        loop {
            let events = store.read_all(self.position, batch_size)?;
            let fetched = events.len();
            applied += self.apply_batch(events)?;
            if fetched < batch_size {
                break;
            }
        }
        if applied > 0 {
            tracing::debug!(
                projection = self.projection.name(),
                applied,
                position = self.position,
                "projection caught up"
            );
        }
        Ok(applied)
    }

    /// Discard derived state and replay the whole log.
    pub fn rebuild(&mut self, store: &dyn EventStore) -> Result<usize, EvographError> {
        self.projection.reset();
        self.sequencer.clear();
        self.position = 0;
        let applied = self.catch_up(store, DEFAULT_CATCH_UP_BATCH)?;
        tracing::info!(
            projection = self.projection.name(),
            applied,
            "projection rebuilt"
        );
        Ok(applied)
    }

    /// How far behind the log head this runner is.
    pub fn lag(&self, store: &dyn EventStore) -> Result<u64, EvographError> {
        Ok(store.last_position()?.saturating_sub(self.position))
    }
}
