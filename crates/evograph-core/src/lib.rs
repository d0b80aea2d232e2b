//! # evograph-core
//!
//! The event-sourced graph aggregate engine - THE LOGIC.
//!
//! This crate implements:
//! - a generic, recursively composable graph substrate (`graph`)
//! - state-machine aggregates that govern every mutation (`aggregate`)
//! - an append-only, hash-chained event log with snapshots (`storage`, `event`)
//! - rebuildable read models fed from the log (`projection`)
//! - a conceptual-space index for similarity queries (`conceptual`)
//!
//! ## Data Flow
//!
//! ```text
//! Command -> Repository::execute -> transition() -> EventStore::append
//!                                                        |
//!                      ProjectionRunner::catch_up  <-----+
//! ```
//!
//! ## Architectural Constraints
//!
//! - The event log is the ONLY source of truth; everything else is derived
//! - No async, no network dependencies (pure Rust)
//! - No global state: callers own a `Session` and pass it explicitly
//! - Deterministic: every map is ordered, every tie is broken by id

// =============================================================================
// MODULES
// =============================================================================

pub mod aggregate;
pub mod collaboration;
pub mod conceptual;
pub mod event;
pub mod formats;
pub mod graph;
pub mod primitives;
pub mod projection;
pub mod session;
pub mod storage;
pub mod subject;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AggregateId, CausationId, CorrelationId, EdgeId, ElementId, ErrorCategory, EventId,
    EvographError, GraphId, NodeId,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use aggregate::{
    Aggregate, AggregateRoot, Committed, GraphAggregate, GraphCommand, GraphEvent, GraphState,
    Repository, SnapshotPolicy, TransitionTable, transition,
};
pub use collaboration::{CollaborationEvent, CollaborationLog};
pub use conceptual::{
    ClusterConfig, ConceptualIndex, ConceptualPoint, ConceptualSpace, ConvexRegion, Metric,
    MetricRegistry,
};
pub use event::{ChainVerification, ContentHash, EventEnvelope, EventMetadata, NewEvent, verify_chain};
pub use graph::{Graph, Invariant, Subgraph};
pub use projection::{
    ConceptualProjection, EventSequencer, GraphSummaryProjection, Projection, ProjectionCheckpoint,
    ProjectionRunner,
};
pub use session::{Session, SessionStatus, StorageBackend};
pub use storage::{EventStore, InMemoryEventStore, RedbEventStore, Snapshot};
pub use subject::{Subject, SubjectPattern, SubjectRouter};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{ArchiveHeader, archive_from_bytes, archive_to_bytes};
