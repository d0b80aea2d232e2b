//! Feeds mapped concepts into a `ConceptualIndex`.

use super::Projection;
use crate::aggregate::{Aggregate, GraphAggregate, GraphEvent};
use crate::conceptual::{ConceptualIndex, ConceptualPoint};
use crate::event::EventEnvelope;
use crate::{AggregateId, EvographError, NodeId};
use std::collections::BTreeMap;

/// Maintains the conceptual index from `ConceptMapped` and `NodeRemoved`
/// events.
///
/// Points that do not fit the index's space are logged and skipped, so a
/// single bad mapping never stalls the feed.
#[derive(Debug)]
pub struct ConceptualProjection {
    index: ConceptualIndex,
    owners: BTreeMap<NodeId, AggregateId>,
    skipped: usize,
}

impl ConceptualProjection {
    #[must_use]
    pub fn new(index: ConceptualIndex) -> Self {
        Self {
            index,
            owners: BTreeMap::new(),
            skipped: 0,
        }
    }

    #[must_use]
    pub fn index(&self) -> &ConceptualIndex {
        &self.index
    }

    /// The graph aggregate a node's point came from.
    #[must_use]
    pub fn owner(&self, node_id: NodeId) -> Option<AggregateId> {
        self.owners.get(&node_id).copied()
    }

    /// Mappings rejected by the index since the last reset.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Projection for ConceptualProjection {
    fn name(&self) -> &str {
        "conceptual"
    }

    fn apply(&mut self, event: &EventEnvelope) -> Result<(), EvographError> {
        if event.aggregate_type != GraphAggregate::AGGREGATE_TYPE {
            return Ok(());
        }
        match event.decode::<GraphEvent>()? {
            GraphEvent::ConceptMapped {
                node_id,
                coordinates,
                confidence,
            } => {
                let point = ConceptualPoint::new(node_id, coordinates, confidence);
                match self.index.upsert(point) {
                    Ok(()) => {
                        self.owners.insert(node_id, event.aggregate_id);
                    }
                    Err(e) => {
                        self.skipped += 1;
                        tracing::warn!(
                            aggregate_id = %event.aggregate_id,
                            version = event.aggregate_version,
                            node_id = %node_id,
                            error = %e,
                            "concept skipped"
                        );
                    }
                }
            }
            GraphEvent::NodeRemoved { node_id, .. } => {
                if self.owners.get(&node_id) == Some(&event.aggregate_id) {
                    self.owners.remove(&node_id);
                    self.index.remove(node_id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.index.clear();
        self.owners.clear();
        self.skipped = 0;
    }
}
