//! # Command Dispatcher
//!
//! The async front of the synchronous engine.
//!
//! - One writer per aggregate: commands for the same aggregate queue on a
//!   per-aggregate `tokio::sync::Mutex`, different aggregates run in parallel.
//! - Store calls run on the blocking pool under a timeout. A timed-out append
//!   yields `CommandOutcome::Unknown`, never a failure; `confirm` resolves it
//!   later by looking up the command id in the log.
//! - Conflicts and transport-like errors are retried with capped exponential
//!   backoff. Validation and state-machine errors are returned at once.
//! - A background projector pulls new events into the projections after every
//!   commit until told to shut down.

use crate::config::RuntimeConfig;
use evograph_core::{
    AggregateId, CausationId, CorrelationId, EventEnvelope, EventMetadata, EventStore,
    EvographError, GraphCommand, Session,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// Idle per-aggregate locks are pruned once the table grows past this.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Exponential backoff for retryable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 25,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay_ms`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

// =============================================================================
// ENVELOPE & OUTCOME
// =============================================================================

/// Wire form of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub command_type: String,
    pub aggregate_id: AggregateId,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Command id. Generated when absent and stamped on every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<CausationId>,
    /// Pin the command to this version. Conflicts are then returned, not retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl CommandEnvelope {
    /// Envelope for a typed command.
    pub fn new(aggregate_id: AggregateId, command: &GraphCommand) -> Result<Self, EvographError> {
        let mut wire = serde_json::to_value(command)
            .map_err(|e| EvographError::SerializationError(e.to_string()))?;
        let command_type = wire
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| EvographError::SerializationError("command has no type".to_string()))?;
        let payload = wire
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok(Self {
            command_type,
            aggregate_id,
            payload,
            correlation_id: None,
            causation_id: None,
            expected_version: None,
        })
    }

    #[must_use]
    pub fn with_causation(mut self, id: CausationId) -> Self {
        self.causation_id = Some(id);
        self
    }

    #[must_use]
    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn command(&self) -> Result<GraphCommand, EvographError> {
        GraphCommand::from_parts(&self.command_type, self.payload.clone())
    }
}

/// Result of dispatching a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Committed {
        aggregate_id: AggregateId,
        version: u64,
        command_id: CausationId,
        events: Vec<EventEnvelope>,
    },
    /// The append did not answer in time. It may or may not have landed.
    Unknown {
        aggregate_id: AggregateId,
        expected_version: u64,
        command_id: CausationId,
    },
}

impl CommandOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    #[must_use]
    pub fn command_id(&self) -> CausationId {
        match self {
            Self::Committed { command_id, .. } | Self::Unknown { command_id, .. } => *command_id,
        }
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

#[derive(Debug)]
pub struct CommandDispatcher {
    session: Arc<Session>,
    locks: Mutex<HashMap<AggregateId, Arc<tokio::sync::Mutex<()>>>>,
    append_timeout: Duration,
    projection_timeout: Duration,
    retry: RetryPolicy,
    committed: Notify,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(session: Arc<Session>, runtime: &RuntimeConfig) -> Self {
        Self {
            session,
            locks: Mutex::new(HashMap::new()),
            append_timeout: runtime.append_timeout(),
            projection_timeout: runtime.projection_timeout(),
            retry: runtime.retry,
            committed: Notify::new(),
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn lock_for(&self, aggregate_id: AggregateId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(aggregate_id).or_default())
    }

    /// Run `f` on the blocking pool, bounded by `limit`.
    async fn blocking<T, F>(&self, limit: Duration, f: F) -> Result<T, EvographError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, EvographError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let task = tokio::task::spawn_blocking(move || f(&session));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EvographError::Unavailable(format!(
                "blocking task failed: {}",
                e
            ))),
            Err(_) => Err(EvographError::Timeout(limit.as_millis() as u64)),
        }
    }

    /// Read from the session off the async workers, bounded by the
    /// projection timeout.
    pub async fn read<T, F>(&self, f: F) -> Result<T, EvographError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, EvographError> + Send + 'static,
    {
        self.blocking(self.projection_timeout, f).await
    }

    /// Dispatch a command envelope.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<CommandOutcome, EvographError> {
        let command = envelope.command()?;
        let aggregate_id = envelope.aggregate_id;
        let command_id = envelope.causation_id.unwrap_or_else(CausationId::new);

        let lock = self.lock_for(aggregate_id);
        let _guard = lock.lock().await;

        let mut attempt = 0u32;
        loop {
            let error = match self
                .attempt(&envelope, &command, command_id)
                .await
            {
                Ok(outcome) => {
                    if outcome.is_committed() {
                        self.committed.notify_one();
                    }
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            let pinned_conflict = envelope.expected_version.is_some()
                && matches!(error, EvographError::ConcurrencyConflict { .. });
            if !error.is_retryable() || pinned_conflict {
                return Err(error);
            }

            // A transport failure may have hidden a successful append.
            if !matches!(error, EvographError::ConcurrencyConflict { .. }) {
                match self.find_committed(aggregate_id, command_id).await {
                    Ok(Some(outcome)) => {
                        self.committed.notify_one();
                        return Ok(outcome);
                    }
                    Ok(None) => {}
                    Err(lookup) if attempt >= self.retry.max_retries => {
                        tracing::warn!(
                            aggregate_id = %aggregate_id,
                            command_id = %command_id,
                            error = %lookup,
                            "Could not confirm command after retries"
                        );
                        let expected_version = envelope.expected_version.unwrap_or_default();
                        return Ok(CommandOutcome::Unknown {
                            aggregate_id,
                            expected_version,
                            command_id,
                        });
                    }
                    Err(_) => {}
                }
            }

            if attempt >= self.retry.max_retries {
                return Err(error);
            }
            let delay = self.retry.delay(attempt);
            tracing::debug!(
                aggregate_id = %aggregate_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying command"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        envelope: &CommandEnvelope,
        command: &GraphCommand,
        command_id: CausationId,
    ) -> Result<CommandOutcome, EvographError> {
        let aggregate_id = envelope.aggregate_id;
        let correlation_id = envelope.correlation_id;
        let expected_version = match envelope.expected_version {
            Some(version) => version,
            None => {
                self.blocking(self.append_timeout, move |s| s.graphs().version(aggregate_id))
                    .await?
            }
        };

        let command = command.clone();
        let metadata = EventMetadata {
            correlation_id,
            causation_id: Some(command_id),
        };
        let result = self
            .blocking(self.append_timeout, move |s| {
                s.execute_expecting(aggregate_id, expected_version, &command, metadata)
            })
            .await;

        match result {
            Ok(committed) => Ok(CommandOutcome::Committed {
                aggregate_id,
                version: committed.root.version,
                command_id,
                events: committed.events,
            }),
            Err(EvographError::Timeout(ms)) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    expected_version,
                    command_id = %command_id,
                    timeout_ms = ms,
                    "Append timed out; outcome unknown"
                );
                Ok(CommandOutcome::Unknown {
                    aggregate_id,
                    expected_version,
                    command_id,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn find_committed(
        &self,
        aggregate_id: AggregateId,
        command_id: CausationId,
    ) -> Result<Option<CommandOutcome>, EvographError> {
        let events = self
            .blocking(self.append_timeout, move |s| {
                s.store().find_by_causation(aggregate_id, command_id)
            })
            .await?;
        let Some(version) = events.last().map(|e| e.aggregate_version) else {
            return Ok(None);
        };
        Ok(Some(CommandOutcome::Committed {
            aggregate_id,
            version,
            command_id,
            events,
        }))
    }

    /// Resolve an unknown outcome by looking for the command's events.
    ///
    /// Still `Unknown` when nothing is found: the append may yet land.
    pub async fn confirm(&self, outcome: &CommandOutcome) -> Result<CommandOutcome, EvographError> {
        match outcome {
            CommandOutcome::Committed { .. } => Ok(outcome.clone()),
            CommandOutcome::Unknown {
                aggregate_id,
                command_id,
                ..
            } => Ok(self
                .find_committed(*aggregate_id, *command_id)
                .await?
                .unwrap_or_else(|| outcome.clone())),
        }
    }

    // =========================================================================
    // PROJECTIONS
    // =========================================================================

    /// One bounded catch-up round over every projection.
    pub async fn catch_up(&self) -> Result<usize, EvographError> {
        self.blocking(self.projection_timeout, |s| s.catch_up()).await
    }

    /// Catch up before a read. Failures leave the last applied state in place.
    pub async fn refresh(&self) {
        if let Err(e) = self.catch_up().await {
            tracing::warn!(error = %e, "Projection catch-up failed; serving last applied state");
        }
    }

    /// Pull events into the projections after every commit until `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_projector(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = dispatcher.committed.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match dispatcher.catch_up().await {
                    Ok(0) => {}
                    Ok(applied) => tracing::debug!(applied, "Projections caught up"),
                    Err(e) => tracing::warn!(error = %e, "Projection catch-up failed"),
                }
            }
            tracing::debug!("Projector stopped");
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use evograph_core::{ErrorCategory, NodeId};
    use std::collections::BTreeMap;

    fn dispatcher() -> Arc<CommandDispatcher> {
        let session = Arc::new(Session::new().expect("session"));
        let runtime = RuntimeConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..RuntimeConfig::default()
        };
        Arc::new(CommandDispatcher::new(session, &runtime))
    }

    fn create(id: AggregateId) -> CommandEnvelope {
        CommandEnvelope::new(
            id,
            &GraphCommand::CreateGraph {
                name: "g".into(),
                graph_id: None,
            },
        )
        .expect("envelope")
    }

    fn add_node(id: AggregateId, node: NodeId) -> CommandEnvelope {
        CommandEnvelope::new(
            id,
            &GraphCommand::AddNode {
                label: "n".into(),
                node_id: Some(node),
                properties: BTreeMap::new(),
            },
        )
        .expect("envelope")
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 10,
            max_delay_ms: 100,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(4), Duration::from_millis(100));
        assert_eq!(policy.delay(200), Duration::from_millis(100));
    }

    #[test]
    fn test_envelope_wire_form() {
        let id = AggregateId::new();
        let envelope = create(id);
        assert_eq!(envelope.command_type, "CreateGraph");
        let json = serde_json::to_value(&envelope).expect("json");
        assert_eq!(json["type"], "CreateGraph");
        assert_eq!(json["payload"]["name"], "g");
        assert!(json.get("causation_id").is_none());

        let parsed: CommandEnvelope = serde_json::from_value(serde_json::json!({
            "type": "Freeze",
            "aggregate_id": id.to_string(),
        }))
        .expect("parse");
        assert_eq!(parsed.command().expect("command"), GraphCommand::Freeze {});
    }

    #[tokio::test]
    async fn test_dispatch_commits_and_stamps_command_id() {
        let dispatcher = dispatcher();
        let id = AggregateId::new();
        let command_id = CausationId::new();

        let outcome = dispatcher
            .dispatch(create(id).with_causation(command_id))
            .await
            .expect("create");
        assert!(matches!(outcome, CommandOutcome::Committed { version: 1, .. }));
        assert_eq!(outcome.command_id(), command_id);

        let stored = dispatcher.session().events(id, 0).expect("events");
        assert!(!stored.is_empty());
        assert!(stored.iter().all(|e| e.causation_id == Some(command_id)));

        let second = dispatcher
            .dispatch(add_node(id, NodeId::new()))
            .await
            .expect("add");
        assert!(matches!(second, CommandOutcome::Committed { version: 2, .. }));
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let dispatcher = dispatcher();
        let id = AggregateId::new();

        let unknown = CommandEnvelope {
            command_type: "Explode".into(),
            ..create(id)
        };
        let err = dispatcher.dispatch(unknown).await.expect_err("bad type");
        assert_eq!(err.category(), ErrorCategory::Validation);

        let early = add_node(id, NodeId::new());
        let err = dispatcher.dispatch(early).await.expect_err("not created");
        assert_eq!(err.category(), ErrorCategory::StateMachine);
        assert_eq!(
            dispatcher.session().graphs().version(id).expect("version"),
            0
        );
    }

    #[tokio::test]
    async fn test_pinned_version_conflict_is_returned() {
        let dispatcher = dispatcher();
        let id = AggregateId::new();
        dispatcher.dispatch(create(id)).await.expect("create");

        let stale = add_node(id, NodeId::new()).expecting(0);
        let err = dispatcher.dispatch(stale).await.expect_err("stale");
        assert!(matches!(err, EvographError::ConcurrencyConflict { .. }));

        let fresh = add_node(id, NodeId::new()).expecting(1);
        let outcome = dispatcher.dispatch(fresh).await.expect("fresh");
        assert!(matches!(outcome, CommandOutcome::Committed { version: 2, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_aggregate_commands_serialize() {
        let dispatcher = dispatcher();
        let id = AggregateId::new();
        dispatcher.dispatch(create(id)).await.expect("create");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.dispatch(add_node(id, NodeId::new())).await })
            })
            .collect();
        for task in tasks {
            let outcome = task.await.expect("join").expect("dispatch");
            assert!(outcome.is_committed());
        }

        assert_eq!(
            dispatcher.session().graphs().version(id).expect("version"),
            17
        );
    }

    #[tokio::test]
    async fn test_confirm_resolves_unknown() {
        let dispatcher = dispatcher();
        let id = AggregateId::new();
        let command_id = CausationId::new();
        dispatcher
            .dispatch(create(id).with_causation(command_id))
            .await
            .expect("create");

        let landed = CommandOutcome::Unknown {
            aggregate_id: id,
            expected_version: 0,
            command_id,
        };
        let confirmed = dispatcher.confirm(&landed).await.expect("confirm");
        assert!(matches!(confirmed, CommandOutcome::Committed { version: 1, .. }));

        let lost = CommandOutcome::Unknown {
            aggregate_id: id,
            expected_version: 1,
            command_id: CausationId::new(),
        };
        assert_eq!(dispatcher.confirm(&lost).await.expect("confirm"), lost);
    }

    #[tokio::test]
    async fn test_outcome_wire_tag() {
        let outcome = CommandOutcome::Unknown {
            aggregate_id: AggregateId::new(),
            expected_version: 3,
            command_id: CausationId::new(),
        };
        let json = serde_json::to_value(&outcome).expect("json");
        assert_eq!(json["outcome"], "unknown");
        assert_eq!(json["expected_version"], 3);
    }

    #[tokio::test]
    async fn test_projector_catches_up_and_stops() {
        let dispatcher = dispatcher();
        let (stop, shutdown) = watch::channel(false);
        let handle = dispatcher.spawn_projector(shutdown);

        let id = AggregateId::new();
        dispatcher.dispatch(create(id)).await.expect("create");

        let mut seen = false;
        for _ in 0..100 {
            if dispatcher.session().summary(id).is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "projector should apply the committed event");

        stop.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("projector stops")
            .expect("join");
    }
}
