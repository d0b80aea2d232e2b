//! # Session Module
//!
//! The engine context: one event store, the graph repository on top of it,
//! and the projections fed from it. Nothing here is global; callers own a
//! `Session` and pass it explicitly.
//!
//! ## Storage Backends
//!
//! - `InMemory`: volatile, for tests and scratch work
//! - `Persistent`: redb-backed, durable across restarts
//!
//! Projections are maintained by pulling (`catch_up`). Commands never wait
//! for them, so a query may briefly lag the log.

use crate::aggregate::{
    AggregateRoot, Committed, GraphAggregate, GraphCommand, Repository, SnapshotPolicy,
};
use crate::conceptual::{ClusterConfig, ConceptualIndex, ConceptualSpace, ConvexRegion, Metric, Neighbours};
use crate::event::{ChainVerification, EventEnvelope, EventMetadata, NewEvent, verify_chain};
use crate::formats::{export_store, import_store};
use crate::primitives::DEFAULT_CATCH_UP_BATCH;
use crate::projection::{
    ConceptualProjection, GraphSummary, GraphSummaryProjection, ProjectionRunner,
};
use crate::storage::{EventStore, InMemoryEventStore, RedbEventStore, Snapshot};
use crate::{AggregateId, CausationId, EvographError, NodeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    InMemory(InMemoryEventStore),
    Persistent(RedbEventStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(InMemoryEventStore::new())
    }
}

impl StorageBackend {
    fn inner(&self) -> &dyn EventStore {
        match self {
            Self::InMemory(store) => store,
            Self::Persistent(store) => store,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "memory",
            Self::Persistent(_) => "redb",
        }
    }
}

impl EventStore for StorageBackend {
    fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        self.inner()
            .append(aggregate_id, aggregate_type, expected_version, events)
    }

    fn load(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        self.inner().load(aggregate_id, from_version)
    }

    fn current_version(&self, aggregate_id: AggregateId) -> Result<u64, EvographError> {
        self.inner().current_version(aggregate_id)
    }

    fn aggregate_type(&self, aggregate_id: AggregateId) -> Result<Option<String>, EvographError> {
        self.inner().aggregate_type(aggregate_id)
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EvographError> {
        self.inner().save_snapshot(snapshot)
    }

    fn latest_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EvographError> {
        self.inner().latest_snapshot(aggregate_id)
    }

    fn read_all(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        self.inner().read_all(after_position, limit)
    }

    fn last_position(&self) -> Result<u64, EvographError> {
        self.inner().last_position()
    }

    fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EvographError> {
        self.inner().aggregate_ids()
    }

    fn event_count(&self) -> Result<u64, EvographError> {
        self.inner().event_count()
    }

    fn import(&self, events: Vec<EventEnvelope>) -> Result<usize, EvographError> {
        self.inner().import(events)
    }

    fn find_by_causation(
        &self,
        aggregate_id: AggregateId,
        causation_id: CausationId,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        self.inner().find_by_causation(aggregate_id, causation_id)
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub backend: String,
    pub aggregates: usize,
    pub events: u64,
    pub last_position: u64,
    pub summary_position: u64,
    pub conceptual_position: u64,
    pub indexed_points: usize,
    pub skipped_concepts: usize,
    pub dimensions: usize,
    pub metric: String,
}

/// Verification result for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVerification {
    pub aggregate_id: AggregateId,
    #[serde(flatten)]
    pub chain: ChainVerification,
}

/// The engine context.
#[derive(Debug)]
pub struct Session {
    store: Arc<StorageBackend>,
    graphs: Repository<GraphAggregate, Arc<StorageBackend>>,
    summary: RwLock<ProjectionRunner<GraphSummaryProjection>>,
    concepts: RwLock<ProjectionRunner<ConceptualProjection>>,
}

/// Default space: three dimensions, Euclidean.
fn default_space() -> Result<ConceptualSpace, EvographError> {
    ConceptualSpace::new(3, Metric::Euclidean)
}

impl Session {
    /// In-memory session with the default conceptual space.
    pub fn new() -> Result<Self, EvographError> {
        Ok(Self::with_backend(
            StorageBackend::default(),
            default_space()?,
            ClusterConfig::default(),
        ))
    }

    /// Session over a redb database at `path`, created if missing.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, EvographError> {
        let store = RedbEventStore::open(path)?;
        Ok(Self::with_backend(
            StorageBackend::Persistent(store),
            default_space()?,
            ClusterConfig::default(),
        ))
    }

    #[must_use]
    pub fn with_backend(
        backend: StorageBackend,
        space: ConceptualSpace,
        clustering: ClusterConfig,
    ) -> Self {
        let store = Arc::new(backend);
        let index = ConceptualIndex::with_clustering(space, clustering);
        Self {
            graphs: Repository::new(Arc::clone(&store)),
            store,
            summary: RwLock::new(ProjectionRunner::new(GraphSummaryProjection::new())),
            concepts: RwLock::new(ProjectionRunner::new(ConceptualProjection::new(index))),
        }
    }

    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.graphs = self.graphs.with_snapshot_policy(policy);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StorageBackend> {
        &self.store
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(*self.store, StorageBackend::Persistent(_))
    }

    #[must_use]
    pub fn graphs(&self) -> &Repository<GraphAggregate, Arc<StorageBackend>> {
        &self.graphs
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Reject commands that could never be indexed before they reach the log.
    fn precheck(&self, command: &GraphCommand) -> Result<(), EvographError> {
        if let GraphCommand::MapConcept { coordinates, .. } = command {
            let expected = self.concepts.read().projection().index().space().dimensions();
            if coordinates.len() != expected {
                return Err(EvographError::DimensionMismatch {
                    expected,
                    actual: coordinates.len(),
                });
            }
        }
        Ok(())
    }

    /// Run a command against a graph aggregate.
    pub fn execute(
        &self,
        aggregate_id: AggregateId,
        command: &GraphCommand,
        metadata: EventMetadata,
    ) -> Result<Committed<GraphAggregate>, EvographError> {
        self.precheck(command)?;
        self.graphs.execute(aggregate_id, command, metadata)
    }

    /// Run a command only if the aggregate is at `expected_version`.
    pub fn execute_expecting(
        &self,
        aggregate_id: AggregateId,
        expected_version: u64,
        command: &GraphCommand,
        metadata: EventMetadata,
    ) -> Result<Committed<GraphAggregate>, EvographError> {
        self.precheck(command)?;
        self.graphs
            .execute_expecting(aggregate_id, expected_version, command, metadata)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Current state of a graph aggregate with its version.
    pub fn get_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<AggregateRoot<GraphAggregate>, EvographError> {
        self.graphs.get(aggregate_id)
    }

    /// Nodes near `node_id` in the conceptual space, nearest first.
    pub fn find_similar(
        &self,
        node_id: NodeId,
        threshold: f32,
        limit: usize,
    ) -> Result<Neighbours, EvographError> {
        self.concepts
            .read()
            .projection()
            .index()
            .similar_to(node_id, threshold, limit)
    }

    /// Fewest-hop path between two nodes of one graph.
    pub fn find_path(
        &self,
        aggregate_id: AggregateId,
        source: NodeId,
        target: NodeId,
    ) -> Result<Vec<NodeId>, EvographError> {
        let root = self.graphs.get(aggregate_id)?;
        let graph = root.state.graph();
        for node in [source, target] {
            if !graph.contains_node(node) {
                return Err(EvographError::NodeNotFound(node));
            }
        }
        graph
            .shortest_path(source, target)
            .ok_or(EvographError::PathNotFound(source, target))
    }

    /// Stored events of one aggregate after `from_version`.
    pub fn events(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EvographError> {
        self.store.load(aggregate_id, from_version)
    }

    pub fn summary(&self, aggregate_id: AggregateId) -> Option<GraphSummary> {
        self.summary.read().projection().get(aggregate_id).cloned()
    }

    pub fn summaries(&self) -> Vec<GraphSummary> {
        self.summary.read().projection().all().cloned().collect()
    }

    pub fn clusters(&self) -> Vec<ConvexRegion> {
        self.concepts.read().projection().index().clusters().to_vec()
    }

    // =========================================================================
    // PROJECTIONS
    // =========================================================================

    /// Pull new events into every projection.
    pub fn catch_up(&self) -> Result<usize, EvographError> {
        let store: &dyn EventStore = self.store.as_ref();
        let summary = self.summary.write().catch_up(store, DEFAULT_CATCH_UP_BATCH)?;
        let concepts = self.concepts.write().catch_up(store, DEFAULT_CATCH_UP_BATCH)?;
        Ok(summary.max(concepts))
    }

    /// Discard and rebuild every projection from the log.
    pub fn rebuild_projections(&self) -> Result<usize, EvographError> {
        let store: &dyn EventStore = self.store.as_ref();
        let summary = self.summary.write().rebuild(store)?;
        let concepts = self.concepts.write().rebuild(store)?;
        Ok(summary.max(concepts))
    }

    // =========================================================================
    // AUDIT & ARCHIVE
    // =========================================================================

    /// Verify one aggregate's hash chain.
    pub fn verify(&self, aggregate_id: AggregateId) -> Result<ChainVerification, EvographError> {
        let events = self.store.load(aggregate_id, 0)?;
        if events.is_empty() {
            return Err(EvographError::AggregateNotFound(aggregate_id));
        }
        Ok(verify_chain(&events))
    }

    /// Verify every aggregate in the log.
    pub fn verify_all(&self) -> Result<Vec<AggregateVerification>, EvographError> {
        self.store
            .aggregate_ids()?
            .into_iter()
            .map(|aggregate_id| {
                let events = self.store.load(aggregate_id, 0)?;
                Ok(AggregateVerification {
                    aggregate_id,
                    chain: verify_chain(&events),
                })
            })
            .collect()
    }

    pub fn export_archive(&self) -> Result<Vec<u8>, EvographError> {
        export_store(self.store.as_ref())
    }

    /// Import an archive, then bring projections up to date.
    pub fn import_archive(&self, bytes: &[u8]) -> Result<usize, EvographError> {
        let imported = import_store(self.store.as_ref(), bytes)?;
        self.catch_up()?;
        Ok(imported)
    }

    pub fn status(&self) -> Result<SessionStatus, EvographError> {
        let summary = self.summary.read();
        let concepts = self.concepts.read();
        let index = concepts.projection().index();
        Ok(SessionStatus {
            backend: self.store.kind().to_string(),
            aggregates: self.store.aggregate_ids()?.len(),
            events: self.store.event_count()?,
            last_position: self.store.last_position()?,
            summary_position: summary.position(),
            conceptual_position: concepts.position(),
            indexed_points: index.len(),
            skipped_concepts: concepts.projection().skipped(),
            dimensions: index.space().dimensions(),
            metric: index.space().metric().name().to_string(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
