//! # Engine Primitives
//!
//! Hardcoded runtime constants for the engine.
//!
//! These bounds are compiled into the binary. Configurable knobs (timeouts,
//! retry policy, snapshot cadence) live in their owning modules and take
//! their defaults from here.

/// Magic bytes for the event-log archive header.
///
/// - File Header = Magic Bytes ("EVOG") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"EVOG";

/// Current archive format version.
///
/// Increment this when making breaking changes to the archive format.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum path length for path enumeration.
///
/// Limits the number of nodes in a single path so that `find_paths`
/// is always finite, even on dense graphs.
pub const MAX_PATH_LENGTH: usize = 1000;

/// Maximum nesting depth of subgraph components.
///
/// A graph nested deeper than this is rejected at attach time.
pub const MAX_SUBGRAPH_DEPTH: usize = 64;

/// Largest version gap the projection sequencer buffers before failing.
pub const MAX_SEQUENCE_GAP: u64 = 100;

/// Default number of versions between automatic snapshots.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Default batch size for pull-based projection catch-up.
pub const DEFAULT_CATCH_UP_BATCH: usize = 500;

/// Upper bound on `k` and `limit` for similarity queries.
pub const MAX_NEIGHBORS: usize = 1000;

/// Maximum number of dimensions of a conceptual space.
pub const MAX_DIMENSIONS: usize = 4096;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for names and labels (graph names, node labels, event types).
pub const MAX_LABEL_LENGTH: usize = 256;

/// Maximum serialized size of a single command or event payload (1 MB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum number of events appended in one call.
pub const MAX_APPEND_BATCH: usize = 10_000;
