//! Transactional envelope around the pure transition function.

use super::{Aggregate, AggregateRoot, Command, to_new_event, transition};
use crate::event::{EventEnvelope, EventMetadata};
use crate::primitives::DEFAULT_SNAPSHOT_EVERY;
use crate::storage::EventStore;
use crate::{AggregateId, EvographError};
use std::marker::PhantomData;

/// How often the repository snapshots an aggregate after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot whenever the version crosses a multiple of this. 0 disables.
    pub every: u64,
}

impl SnapshotPolicy {
    #[must_use]
    pub const fn never() -> Self {
        Self { every: 0 }
    }

    #[must_use]
    pub const fn every(every: u64) -> Self {
        Self { every }
    }

    /// Whether moving from `before` to `after` crossed a snapshot boundary.
    fn due(&self, before: u64, after: u64) -> bool {
        self.every != 0 && before / self.every != after / self.every
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_SNAPSHOT_EVERY)
    }
}

/// Result of a committed command.
#[derive(Debug, Clone)]
pub struct Committed<A> {
    pub root: AggregateRoot<A>,
    pub events: Vec<EventEnvelope>,
}

/// Loads aggregates from an event store and commits their transitions.
///
/// One `execute` is: load (snapshot + tail), run the pure transition,
/// append with the loaded version as the expected version. A concurrent
/// writer makes the append fail with `ConcurrencyConflict`; nothing is
/// retried here.
#[derive(Debug)]
pub struct Repository<A, S> {
    store: S,
    policy: SnapshotPolicy,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate, S: EventStore> Repository<A, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: SnapshotPolicy::default(),
            _aggregate: PhantomData,
        }
    }

    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load an aggregate. Unknown ids load as a fresh root at version 0.
    pub fn load(&self, id: AggregateId) -> Result<AggregateRoot<A>, EvographError> {
        if let Some(stored) = self.store.aggregate_type(id)?
            && stored != A::AGGREGATE_TYPE
        {
            return Err(EvographError::Validation(format!(
                "aggregate {} is a '{}', not a '{}'",
                id,
                stored,
                A::AGGREGATE_TYPE
            )));
        }

        if let Some(snapshot) = self.store.latest_snapshot(id)? {
            let tail = self.store.load(id, snapshot.version)?;
            match AggregateRoot::rehydrate(id, Some(&snapshot), &tail) {
                Ok(root) => return Ok(root),
                // Snapshots are an optimization; fall back to the log.
                Err(e) => tracing::warn!(
                    aggregate_id = %id,
                    version = snapshot.version,
                    error = %e,
                    "snapshot unusable, replaying full log"
                ),
            }
        }

        let events = self.store.load(id, 0)?;
        AggregateRoot::rehydrate(id, None, &events)
    }

    /// Load an aggregate that must exist.
    pub fn get(&self, id: AggregateId) -> Result<AggregateRoot<A>, EvographError> {
        let root = self.load(id)?;
        if root.version == 0 {
            return Err(EvographError::AggregateNotFound(id));
        }
        Ok(root)
    }

    pub fn exists(&self, id: AggregateId) -> Result<bool, EvographError> {
        Ok(self.store.current_version(id)? > 0)
    }

    pub fn version(&self, id: AggregateId) -> Result<u64, EvographError> {
        self.store.current_version(id)
    }

    /// Load, transition and append.
    pub fn execute(
        &self,
        id: AggregateId,
        command: &A::Command,
        metadata: EventMetadata,
    ) -> Result<Committed<A>, EvographError> {
        let root = self.load(id)?;
        self.commit(root, command, metadata)
    }

    /// Like `execute`, but fails with `ConcurrencyConflict` unless the
    /// aggregate is at `expected_version` when loaded.
    pub fn execute_expecting(
        &self,
        id: AggregateId,
        expected_version: u64,
        command: &A::Command,
        metadata: EventMetadata,
    ) -> Result<Committed<A>, EvographError> {
        let root = self.load(id)?;
        if root.version != expected_version {
            return Err(EvographError::ConcurrencyConflict {
                aggregate_id: id,
                expected: expected_version,
                actual: root.version,
            });
        }
        self.commit(root, command, metadata)
    }

    fn commit(
        &self,
        root: AggregateRoot<A>,
        command: &A::Command,
        metadata: EventMetadata,
    ) -> Result<Committed<A>, EvographError> {
        let (state, events) = transition(&root.state, command)?;
        let new_events = events
            .iter()
            .map(|e| to_new_event(e).map(|n| n.with_metadata(metadata)))
            .collect::<Result<Vec<_>, _>>()?;

        let stored = self
            .store
            .append(root.id, A::AGGREGATE_TYPE, root.version, new_events)?;

        let next = AggregateRoot {
            id: root.id,
            version: root.version + stored.len() as u64,
            state,
        };
        tracing::debug!(
            aggregate_id = %next.id,
            version = next.version,
            command = command.name(),
            "command committed"
        );

        if self.policy.due(root.version, next.version) {
            self.snapshot(&next);
        }
        Ok(Committed {
            root: next,
            events: stored,
        })
    }

    /// Persist a snapshot now. Failures are logged, never returned: the
    /// log already holds the truth.
    pub fn snapshot(&self, root: &AggregateRoot<A>) {
        match root.to_snapshot().and_then(|s| self.store.save_snapshot(s)) {
            Ok(()) => {
                tracing::debug!(aggregate_id = %root.id, version = root.version, "snapshot taken");
            }
            Err(e) => tracing::warn!(
                aggregate_id = %root.id,
                version = root.version,
                error = %e,
                "snapshot failed"
            ),
        }
    }
}
