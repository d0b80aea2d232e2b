//! # Aggregate Runtime
//!
//! Every externally visible mutation flows through an aggregate: a pure
//! `(state, command) -> (state, events)` function guarded by an explicit
//! transition table.
//!
//! ## Transition Rules
//!
//! 1. A terminal state accepts nothing (`AggregateTerminal`).
//! 2. A `(state, command)` pair missing from the table is rejected
//!    (`InvalidStateTransition`) before any domain logic runs.
//! 3. Otherwise `decide` validates the command and produces exactly one
//!    event, which is folded into a copy of the aggregate. The resulting
//!    state must be the one the table declares.
//!
//! Nothing here performs I/O; the `Repository` is the transactional
//! envelope that loads, decides and appends.

mod graph_aggregate;
mod repository;

pub use graph_aggregate::{
    ConceptCoordinates, EdgeData, GraphAggregate, GraphCommand, GraphEvent, GraphState, NodeData,
};
pub use repository::{Committed, Repository, SnapshotPolicy};

use crate::event::{EventEnvelope, NewEvent};
use crate::storage::Snapshot;
use crate::{AggregateId, EvographError};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// TRAITS
// =============================================================================

/// A command addressed to an aggregate.
pub trait Command: fmt::Debug + Send + Sync {
    /// Name used to look the command up in the transition table.
    fn name(&self) -> &'static str;
}

/// A fact produced by an aggregate.
///
/// Payloads are stored as JSON. Implementations are expected to use an
/// internally tagged serde representation so the payload is
/// self-describing.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync {
    /// Value stored in the envelope's `type` field.
    fn event_type(&self) -> &'static str;
}

/// Pure domain logic of one aggregate type.
pub trait Aggregate:
    Clone + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable name recorded with every stored event.
    const AGGREGATE_TYPE: &'static str;

    /// The closed set of lifecycle states.
    type State: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Command: Command;
    type Event: DomainEvent;

    /// Current lifecycle state.
    fn state(&self) -> Self::State;

    /// Validate a command against the current state and produce its event.
    ///
    /// Must not perform I/O.
    fn decide(&self, command: &Self::Command) -> Result<Self::Event, EvographError>;

    /// Fold an event into the aggregate. Events are facts: this never fails.
    fn apply(&mut self, event: &Self::Event);

    /// The transition table of this aggregate type.
    fn transitions() -> &'static TransitionTable<Self::State>;
}

// =============================================================================
// TRANSITION TABLE
// =============================================================================

/// Explicit `(from_state, command) -> to_state` rows plus terminal states.
#[derive(Debug, Clone)]
pub struct TransitionTable<S> {
    rows: BTreeMap<(S, &'static str), S>,
    terminal: BTreeSet<S>,
}

impl<S: Copy + Ord> TransitionTable<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            terminal: BTreeSet::new(),
        }
    }

    /// Declare that `command` moves `from` to `to`.
    #[must_use]
    pub fn allow(mut self, from: S, command: &'static str, to: S) -> Self {
        self.rows.insert((from, command), to);
        self
    }

    /// Declare a terminal (sink) state.
    #[must_use]
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    /// Target state, if the pair is declared.
    #[must_use]
    pub fn target(&self, from: S, command: &str) -> Option<S> {
        self.rows
            .iter()
            .find(|((state, name), _)| *state == from && *name == command)
            .map(|(_, to)| *to)
    }

    #[must_use]
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// All declared rows, in `(state, command)` order.
    pub fn rows(&self) -> impl Iterator<Item = (S, &'static str, S)> + '_ {
        self.rows.iter().map(|((from, cmd), to)| (*from, *cmd, *to))
    }

    /// Every command name that appears in the table.
    #[must_use]
    pub fn commands(&self) -> BTreeSet<&'static str> {
        self.rows.keys().map(|(_, cmd)| *cmd).collect()
    }
}

impl<S: Copy + Ord> Default for TransitionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PURE TRANSITION
// =============================================================================

/// Run one command against an aggregate without side effects.
///
/// Returns the next aggregate and the single event that produced it. On
/// error no event exists and the input is untouched.
pub fn transition<A: Aggregate>(
    aggregate: &A,
    command: &A::Command,
) -> Result<(A, Vec<A::Event>), EvographError> {
    let table = A::transitions();
    let from = aggregate.state();

    if table.is_terminal(from) {
        return Err(EvographError::AggregateTerminal {
            state: from.to_string(),
        });
    }
    let Some(to) = table.target(from, command.name()) else {
        return Err(EvographError::InvalidStateTransition {
            state: from.to_string(),
            command: command.name().to_string(),
        });
    };

    let event = aggregate.decide(command)?;
    let mut next = aggregate.clone();
    next.apply(&event);

    if next.state() != to {
        return Err(EvographError::InvalidStateTransition {
            state: from.to_string(),
            command: command.name().to_string(),
        });
    }
    Ok((next, vec![event]))
}

/// Encode a domain event for appending.
pub fn to_new_event<E: DomainEvent>(event: &E) -> Result<NewEvent, EvographError> {
    NewEvent::from_typed(event.event_type(), event)
}

// =============================================================================
// AGGREGATE ROOT
// =============================================================================

/// An aggregate instance with its identity and version.
///
/// `version` equals the number of events folded into `state`.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A> {
    pub id: AggregateId,
    pub version: u64,
    pub state: A,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A not-yet-created aggregate at version 0.
    #[must_use]
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
        }
    }

    /// Lifecycle state of the wrapped aggregate.
    pub fn status(&self) -> A::State {
        self.state.state()
    }

    /// Rebuild from an optional snapshot followed by the events after it.
    pub fn rehydrate(
        id: AggregateId,
        snapshot: Option<&Snapshot>,
        events: &[EventEnvelope],
    ) -> Result<Self, EvographError> {
        let mut root = match snapshot {
            Some(snapshot) => Self::from_snapshot(id, snapshot)?,
            None => Self::new(id),
        };
        for event in events {
            root.apply_envelope(event)?;
        }
        Ok(root)
    }

    /// Fold one stored event. The event must carry the next version.
    pub fn apply_envelope(&mut self, envelope: &EventEnvelope) -> Result<(), EvographError> {
        let expected = self.version + 1;
        if envelope.aggregate_id != self.id || envelope.aggregate_version != expected {
            return Err(EvographError::Validation(format!(
                "event {}@{} cannot follow {}@{}",
                envelope.aggregate_id, envelope.aggregate_version, self.id, self.version
            )));
        }
        let event: A::Event = envelope.decode()?;
        self.state.apply(&event);
        self.version = expected;
        Ok(())
    }

    /// Capture the current state for faster loading.
    pub fn to_snapshot(&self) -> Result<Snapshot, EvographError> {
        let state = serde_json::to_value(&self.state)
            .map_err(|e| EvographError::SerializationError(e.to_string()))?;
        Ok(Snapshot {
            aggregate_id: self.id,
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            version: self.version,
            state,
            taken_at: Utc::now(),
        })
    }

    fn from_snapshot(id: AggregateId, snapshot: &Snapshot) -> Result<Self, EvographError> {
        if snapshot.aggregate_id != id {
            return Err(EvographError::Validation(format!(
                "snapshot of {} cannot restore {}",
                snapshot.aggregate_id, id
            )));
        }
        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            return Err(EvographError::Validation(format!(
                "snapshot of '{}' cannot restore '{}'",
                snapshot.aggregate_type,
                A::AGGREGATE_TYPE
            )));
        }
        let state = serde_json::from_value(snapshot.state.clone())
            .map_err(|e| EvographError::DeserializationError(e.to_string()))?;
        Ok(Self {
            id: snapshot.aggregate_id,
            version: snapshot.version,
            state,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
