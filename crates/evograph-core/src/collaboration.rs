//! # Collaboration Streams
//!
//! Multi-contributor events published under
//! `events.collaboration.<context>.<topic>`. Replicas exchange logs and
//! merge them; concurrent writes to the same key resolve by
//! last-writer-wins over the total order `(timestamp, source, event_id)`.
//!
//! Merge is set union keyed by that order, so it is commutative,
//! associative and idempotent: any two replicas that have seen the same
//! events hold the same log and resolve to the same values.

use crate::subject::{Subject, validate_token};
use crate::{EventId, EvographError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One contributor's write to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub event_id: EventId,
    pub context: String,
    pub topic: String,
    /// Contributor identity.
    pub source: String,
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Position of an event in the merge order.
type MergeKey = (DateTime<Utc>, String, EventId);

impl CollaborationEvent {
    pub fn new(
        context: impl Into<String>,
        topic: impl Into<String>,
        source: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, EvographError> {
        let event = Self {
            event_id: EventId::new(),
            context: context.into(),
            topic: topic.into(),
            source: source.into(),
            key: key.into(),
            value,
            timestamp: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<(), EvographError> {
        validate_token(&self.context)?;
        validate_token(&self.topic)?;
        if self.source.is_empty() || self.key.is_empty() {
            return Err(EvographError::Validation(
                "collaboration source and key must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn subject(&self) -> Result<Subject, EvographError> {
        Subject::collaboration(self.context.clone(), self.topic.clone())
    }

    fn merge_key(&self) -> MergeKey {
        (self.timestamp, self.source.clone(), self.event_id)
    }
}

/// Concurrent writes to one key and the one that won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub context: String,
    pub topic: String,
    pub key: String,
    pub winner: EventId,
    /// Overwritten writes from other sources, oldest first.
    pub superseded: Vec<EventId>,
}

/// A replica's view of the collaboration streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaborationLog {
    events: BTreeMap<MergeKey, CollaborationEvent>,
    ids: BTreeSet<EventId>,
}

impl CollaborationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event. Returns `false` if it was already present.
    pub fn insert(&mut self, event: CollaborationEvent) -> Result<bool, EvographError> {
        event.validate()?;
        if !self.ids.insert(event.event_id) {
            return Ok(false);
        }
        self.events.insert(event.merge_key(), event);
        Ok(true)
    }

    /// Fold another replica's log into this one.
    ///
    /// Returns the number of events that were new here.
    pub fn merge(&mut self, other: &Self) -> usize {
        let mut added = 0;
        for (key, event) in &other.events {
            if self.ids.insert(event.event_id) {
                self.events.insert(key.clone(), event.clone());
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(added, total = self.events.len(), "collaboration logs merged");
        }
        added
    }

    /// Every event in merge order.
    pub fn events(&self) -> impl Iterator<Item = &CollaborationEvent> {
        self.events.values()
    }

    /// Events of one stream in merge order.
    pub fn stream<'a>(
        &'a self,
        context: &'a str,
        topic: &'a str,
    ) -> impl Iterator<Item = &'a CollaborationEvent> + 'a {
        self.events
            .values()
            .filter(move |e| e.context == context && e.topic == topic)
    }

    /// Resolved value of every key in one stream.
    #[must_use]
    pub fn state(&self, context: &str, topic: &str) -> BTreeMap<String, serde_json::Value> {
        let mut state = BTreeMap::new();
        for event in self.stream(context, topic) {
            state.insert(event.key.clone(), event.value.clone());
        }
        state
    }

    /// Keys written by more than one source, with the winning write.
    #[must_use]
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut by_key: BTreeMap<(&str, &str, &str), Vec<&CollaborationEvent>> = BTreeMap::new();
        for event in self.events.values() {
            by_key
                .entry((&event.context, &event.topic, &event.key))
                .or_default()
                .push(event);
        }
        by_key
            .into_iter()
            .filter_map(|((context, topic, key), writes)| {
                let (winner, earlier) = writes.split_last()?;
                let superseded: Vec<EventId> = earlier
                    .iter()
                    .filter(|e| e.source != winner.source)
                    .map(|e| e.event_id)
                    .collect();
                (!superseded.is_empty()).then(|| Conflict {
                    context: context.to_string(),
                    topic: topic.to_string(),
                    key: key.to_string(),
                    winner: winner.event_id,
                    superseded,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
