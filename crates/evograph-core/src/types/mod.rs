//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the engine:
//! - Opaque 128-bit identifiers (`GraphId`, `NodeId`, `EdgeId`, `AggregateId`, ...)
//! - `ElementId` addressing either a node or an edge
//! - Error types (`EvographError`) and their retry classification
//!
//! ## Identity Guarantees
//!
//! Identifiers are random v4 UUIDs. They are globally unique, never reused,
//! and implement `Ord` so that every map keyed by them iterates
//! deterministically.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh, never-before-seen identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Raw 16-byte representation (used as storage key).
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Rebuild from the 16-byte storage representation.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = EvographError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    EvographError::Validation(format!(
                        "invalid {} '{}': {}",
                        stringify!($name),
                        s,
                        e
                    ))
                })
            }
        }
    };
}

uuid_id!(
    /// Identifier of a graph instance (outer or nested).
    GraphId
);
uuid_id!(
    /// Identifier of a node inside a graph arena.
    NodeId
);
uuid_id!(
    /// Identifier of a directed edge inside a graph arena.
    EdgeId
);
uuid_id!(
    /// Identifier of an aggregate (the consistency boundary).
    AggregateId
);
uuid_id!(
    /// Identifier of a stored event.
    EventId
);
uuid_id!(
    /// Identifier shared by all events caused by one command, or linking
    /// a conversation of commands across aggregates.
    CorrelationId
);
uuid_id!(
    /// Identifier of the command (or upstream event) that caused an event.
    CausationId
);

/// Addresses the target of a component: either a node or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementId {
    Node(NodeId),
    Edge(EdgeId),
}

impl From<NodeId> for ElementId {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<EdgeId> for ElementId {
    fn from(id: EdgeId) -> Self {
        Self::Edge(id)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node {}", id),
            Self::Edge(id) => write!(f, "edge {}", id),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur anywhere in the engine.
///
/// - No silent failures
/// - Use `Result<T, EvographError>` for fallible operations
/// - The engine never panics; every error is classified by `category()`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvographError {
    /// A command or input was malformed and was rejected before any state load.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A coordinate vector does not match the dimensionality of its space.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A distance metric does not satisfy the metric-space axioms.
    #[error("Invalid metric '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    /// A subject or subject pattern is malformed.
    #[error("Invalid subject '{0}'")]
    InvalidSubject(String),

    /// The command is not declared for the aggregate's current state.
    #[error("Invalid state transition: command '{command}' is not allowed in state '{state}'")]
    InvalidStateTransition { state: String, command: String },

    /// The aggregate is in a terminal state and accepts no further commands.
    #[error("Aggregate is terminal in state '{state}'")]
    AggregateTerminal { state: String },

    /// The stored version differs from the version the writer expected.
    #[error(
        "Concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },

    /// One or more graph invariants would be violated; the mutation was rolled back.
    #[error("Violated invariant(s): {}", .0.join(", "))]
    ViolatedInvariant(Vec<String>),

    /// Attaching the subgraph would make a graph contain itself.
    #[error("Recursive self reference: graph {0} would contain itself")]
    RecursiveSelfReference(GraphId),

    /// A component of this type is already attached to the element.
    #[error("Duplicate component '{component}' on {element}")]
    DuplicateComponent {
        element: ElementId,
        component: &'static str,
    },

    /// The requested node was not found in the graph.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// The requested edge was not found in the graph.
    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),

    /// The requested aggregate has no events.
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// A consumer received an event too far ahead of the next expected version.
    #[error("Sequence gap on aggregate {aggregate_id}: expected version {expected}, received {received}")]
    SequenceGap {
        aggregate_id: AggregateId,
        expected: u64,
        received: u64,
    },

    /// No path connects the two nodes.
    #[error("No path from {0} to {1}")]
    PathNotFound(NodeId, NodeId),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred in the storage layer.
    #[error("I/O error: {0}")]
    IoError(String),

    /// A collaborator (log, transport) is temporarily unavailable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A bounded operation did not finish in time; its outcome is unknown.
    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

/// Coarse classification used for retry decisions and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    StateMachine,
    Concurrency,
    Invariant,
    NotFound,
    Infrastructure,
}

impl EvographError {
    /// Classify the error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_)
            | Self::DimensionMismatch { .. }
            | Self::InvalidMetric { .. }
            | Self::InvalidSubject(_) => ErrorCategory::Validation,
            Self::InvalidStateTransition { .. } | Self::AggregateTerminal { .. } => {
                ErrorCategory::StateMachine
            }
            Self::ConcurrencyConflict { .. } => ErrorCategory::Concurrency,
            Self::ViolatedInvariant(_)
            | Self::RecursiveSelfReference(_)
            | Self::DuplicateComponent { .. }
            | Self::NodeNotFound(_)
            | Self::EdgeNotFound(_) => ErrorCategory::Invariant,
            Self::AggregateNotFound(_) | Self::PathNotFound(..) => ErrorCategory::NotFound,
            Self::SerializationError(_)
            | Self::DeserializationError(_)
            | Self::SequenceGap { .. }
            | Self::IoError(_)
            | Self::Unavailable(_)
            | Self::Timeout(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Whether resubmitting the same command may succeed.
    ///
    /// Validation and state-machine errors are deterministic: retrying an
    /// identical command against unchanged state yields the same error.
    /// Serialization failures are deterministic too, so only transport-like
    /// infrastructure errors and version conflicts are retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::IoError(_)
                | Self::Unavailable(_)
                | Self::Timeout(_)
        )
    }

    /// Stable machine-readable code for wire responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidMetric { .. } => "INVALID_METRIC",
            Self::InvalidSubject(_) => "INVALID_SUBJECT",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::AggregateTerminal { .. } => "AGGREGATE_TERMINAL",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::ViolatedInvariant(_) => "VIOLATED_INVARIANT",
            Self::RecursiveSelfReference(_) => "RECURSIVE_SELF_REFERENCE",
            Self::DuplicateComponent { .. } => "DUPLICATE_COMPONENT",
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::EdgeNotFound(_) => "EDGE_NOT_FOUND",
            Self::AggregateNotFound(_) => "AGGREGATE_NOT_FOUND",
            Self::PathNotFound(..) => "PATH_NOT_FOUND",
            Self::SequenceGap { .. } => "SEQUENCE_GAP",
            Self::SerializationError(_) => "SERIALIZATION",
            Self::DeserializationError(_) => "DESERIALIZATION",
            Self::IoError(_) => "IO",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
