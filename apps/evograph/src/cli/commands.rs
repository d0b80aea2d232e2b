//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::api;
use crate::config::{BackendKind, CONFIG_FILE_NAME, EvographConfig};
use crate::dispatch::{CommandDispatcher, CommandEnvelope};
use evograph_core::{AggregateId, EvographError, formats::MAX_ARCHIVE_SIZE};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a command file for `submit` (10 MB).
const MAX_SUBMIT_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), EvographError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| EvographError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(EvographError::Validation(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, EvographError> {
    let canonical = path.canonicalize().map_err(|e| {
        EvographError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(EvographError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Canonicalize the parent of an output path and require a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, EvographError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        EvographError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(EvographError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| EvographError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

fn read_input(path: &Path, max_size: u64) -> Result<Vec<u8>, EvographError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, max_size)?;
    std::fs::read(&validated).map_err(|e| EvographError::IoError(format!("Read file: {}", e)))
}

fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn parse_aggregate_id(raw: &str) -> Result<AggregateId, EvographError> {
    raw.parse()
}

/// Parse one envelope or an array of envelopes.
pub fn parse_envelopes(data: &[u8]) -> Result<Vec<CommandEnvelope>, EvographError> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| EvographError::Validation(format!("invalid JSON: {}", e)))?;
    let parsed = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|one| vec![one])
    };
    parsed.map_err(|e| EvographError::Validation(format!("invalid command envelope: {}", e)))
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(
    mut config: EvographConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), EvographError> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let session = config.open_session()?;

    println!("Evograph Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Address:  {}", config.server.address());
    println!("  Backend:  {}", config.storage.backend);
    if config.storage.backend == BackendKind::Redb {
        println!("  Database: {:?}", config.storage.path);
    }
    println!(
        "  Space:    {}-D {}",
        config.conceptual.dimensions, config.conceptual.metric
    );
    println!();
    println!("Endpoints:");
    println!("  POST /commands               - Submit a command");
    println!("  GET  /aggregates/{{id}}        - Aggregate state");
    println!("  GET  /aggregates/{{id}}/events - Aggregate events");
    println!("  POST /query/similar          - Conceptual neighbours");
    println!("  POST /query/path             - Path between nodes");
    println!("  GET  /status                 - Engine status");
    println!("  GET  /health                 - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(&config, session).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show engine status.
pub fn cmd_status(config: &EvographConfig, json_mode: bool) -> Result<(), EvographError> {
    let session = config.open_session()?;
    let status = session.status()?;

    if json_mode {
        print_json(&status);
        return Ok(());
    }

    println!("Evograph Status");
    println!("===============");
    println!("Backend:    {}", status.backend);
    if session.is_persistent() {
        println!("Database:   {:?}", config.storage.path);
    }
    println!();
    println!("Aggregates: {}", status.aggregates);
    println!("Events:     {}", status.events);
    println!("Position:   {}", status.last_position);
    println!();
    println!(
        "Conceptual: {} points in {}-D {}",
        status.indexed_points, status.dimensions, status.metric
    );
    if status.skipped_concepts > 0 {
        println!("Skipped:    {} concepts", status.skipped_concepts);
    }

    Ok(())
}

// =============================================================================
// SUBMIT COMMAND
// =============================================================================

/// Dispatch envelopes in order, stopping at the first rejection.
pub async fn cmd_submit(
    config: &EvographConfig,
    json_mode: bool,
    file: Option<&Path>,
    inline: Option<&str>,
) -> Result<(), EvographError> {
    let data = match (file, inline) {
        (Some(path), _) => read_input(path, MAX_SUBMIT_FILE_SIZE)?,
        (None, Some(json)) => json.as_bytes().to_vec(),
        (None, None) => {
            return Err(EvographError::Validation(
                "submit needs --file or --json".to_string(),
            ));
        }
    };
    let envelopes = parse_envelopes(&data)?;

    let session = Arc::new(config.open_session()?);
    if !session.is_persistent() {
        tracing::warn!("Submitting to the memory backend; nothing will be kept");
    }
    let dispatcher = CommandDispatcher::new(session, &config.runtime);

    let total = envelopes.len();
    for (i, envelope) in envelopes.into_iter().enumerate() {
        let command_type = envelope.command_type.clone();
        let outcome = dispatcher.dispatch(envelope).await.map_err(|e| {
            eprintln!("Command {}/{} ({}) rejected: {}", i + 1, total, command_type, e);
            e
        })?;
        if json_mode {
            print_json(&outcome);
        } else {
            match &outcome {
                crate::dispatch::CommandOutcome::Committed {
                    aggregate_id,
                    version,
                    events,
                    ..
                } => println!(
                    "{} -> {} v{} ({} event(s))",
                    command_type,
                    aggregate_id,
                    version,
                    events.len()
                ),
                crate::dispatch::CommandOutcome::Unknown {
                    aggregate_id,
                    command_id,
                    ..
                } => println!(
                    "{} -> {} outcome unknown (command {})",
                    command_type, aggregate_id, command_id
                ),
            }
        }
    }

    Ok(())
}

// =============================================================================
// SHOW / EVENTS COMMANDS
// =============================================================================

/// Print an aggregate's state.
pub fn cmd_show(
    config: &EvographConfig,
    json_mode: bool,
    aggregate_id: &str,
) -> Result<(), EvographError> {
    let id = parse_aggregate_id(aggregate_id)?;
    let session = config.open_session()?;
    let root = session.get_aggregate(id)?;

    if json_mode {
        print_json(&api::AggregateResponse::from_root(&root)?);
        return Ok(());
    }

    let graph = root.state.graph();
    println!("Aggregate {}", root.id);
    println!("  Name:    {}", root.state.name());
    println!("  Status:  {}", root.status());
    println!("  Version: {}", root.version);
    println!("  Nodes:   {}", graph.node_count());
    println!("  Edges:   {}", graph.edge_count());
    let invariants = graph.invariant_names();
    if !invariants.is_empty() {
        println!("  Invariants: {}", invariants.join(", "));
    }
    for node in graph.nodes().take(20) {
        println!("    node {} [{}]", node.id, node.value.label);
    }
    if graph.node_count() > 20 {
        println!("    ... and {} more", graph.node_count() - 20);
    }

    Ok(())
}

/// List an aggregate's events after `from`.
pub fn cmd_events(
    config: &EvographConfig,
    json_mode: bool,
    aggregate_id: &str,
    from: u64,
) -> Result<(), EvographError> {
    let id = parse_aggregate_id(aggregate_id)?;
    let session = config.open_session()?;
    let events = session.events(id, from)?;

    if json_mode {
        print_json(&events);
        return Ok(());
    }

    if events.is_empty() {
        println!("No events for {} after version {}", id, from);
        return Ok(());
    }
    for event in &events {
        println!(
            "v{:<5} #{:<7} {} {} {}",
            event.aggregate_version,
            event.position,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.hash
        );
    }

    Ok(())
}

// =============================================================================
// VERIFY COMMAND
// =============================================================================

/// Verify one aggregate, or every aggregate in the log.
///
/// Fails when any chain is broken, so scripts can rely on the exit code.
pub fn cmd_verify(
    config: &EvographConfig,
    json_mode: bool,
    aggregate_id: Option<&str>,
) -> Result<(), EvographError> {
    let session = config.open_session()?;
    let results = match aggregate_id {
        Some(raw) => {
            let id = parse_aggregate_id(raw)?;
            vec![evograph_core::session::AggregateVerification {
                aggregate_id: id,
                chain: session.verify(id)?,
            }]
        }
        None => session.verify_all()?,
    };

    if json_mode {
        print_json(&results);
    } else {
        for result in &results {
            match (&result.chain.first_invalid, &result.chain.error) {
                (None, _) => println!(
                    "OK      {} ({} events)",
                    result.aggregate_id, result.chain.length
                ),
                (Some(version), error) => println!(
                    "BROKEN  {} at v{}: {}",
                    result.aggregate_id,
                    version,
                    error.as_deref().unwrap_or("unknown error")
                ),
            }
        }
    }

    let broken = results.iter().filter(|r| !r.chain.is_valid).count();
    if broken > 0 {
        return Err(EvographError::Validation(format!(
            "{} of {} hash chain(s) failed verification",
            broken,
            results.len()
        )));
    }
    Ok(())
}

// =============================================================================
// REPLAY COMMAND
// =============================================================================

/// Rebuild projections from the log and print what they hold.
pub fn cmd_replay(config: &EvographConfig, json_mode: bool) -> Result<(), EvographError> {
    let session = config.open_session()?;
    let applied = session.rebuild_projections()?;
    let summaries = session.summaries();
    let clusters = session.clusters();

    if json_mode {
        print_json(&serde_json::json!({
            "applied": applied,
            "graphs": summaries,
            "clusters": clusters.len(),
        }));
        return Ok(());
    }

    println!("Replayed {} event(s)", applied);
    println!("Graphs: {}", summaries.len());
    for summary in &summaries {
        println!(
            "  {} {:<20} {:<8} v{:<5} nodes={} edges={} concepts={}",
            summary.aggregate_id,
            summary.name,
            summary.status.to_string(),
            summary.last_version,
            summary.node_count,
            summary.edge_count,
            summary.concept_count
        );
    }
    println!("Clusters: {}", clusters.len());

    Ok(())
}

// =============================================================================
// EXPORT / IMPORT COMMANDS
// =============================================================================

/// Export the event log to an archive file.
pub fn cmd_export(config: &EvographConfig, output: &Path) -> Result<(), EvographError> {
    let validated_output = validate_output_path(output)?;
    let session = config.open_session()?;

    let data = session.export_archive()?;
    std::fs::write(&validated_output, &data)
        .map_err(|e| EvographError::IoError(format!("Write file: {}", e)))?;

    println!("Checksum: {}", blake3::hash(&data).to_hex());
    println!("Exported {} bytes to {:?}", data.len(), validated_output);

    Ok(())
}

/// Import an archive into the configured store.
pub fn cmd_import(config: &EvographConfig, input: &Path) -> Result<(), EvographError> {
    let data = read_input(input, MAX_ARCHIVE_SIZE as u64)?;
    let session = config.open_session()?;
    if !session.is_persistent() {
        tracing::warn!("Importing into the memory backend; nothing will be kept");
    }

    let imported = session.import_archive(&data)?;
    let status = session.status()?;
    println!(
        "Imported {} event(s): {} aggregate(s), {} event(s) total",
        imported, status.aggregates, status.events
    );

    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write a default config file and create the database.
pub fn cmd_init(
    config: &EvographConfig,
    config_path: Option<&Path>,
    force: bool,
) -> Result<(), EvographError> {
    let path = config_path.unwrap_or(Path::new(CONFIG_FILE_NAME));
    EvographConfig::write_default(path, force)?;
    println!("Wrote default config to {:?}", path);

    if config.storage.backend == BackendKind::Redb {
        let _session = config.open_session()?;
        println!("Initialized redb database at {:?}", config.storage.path);
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use evograph_core::{GraphCommand, NodeId};
    use std::collections::BTreeMap;

    fn redb_config(dir: &Path) -> EvographConfig {
        let mut config = EvographConfig::default();
        config.storage.path = dir.join("cli.db");
        config
    }

    #[test]
    fn test_parse_envelopes_single_and_array() {
        let id = AggregateId::new();
        let one = serde_json::json!({"type": "CreateGraph", "aggregate_id": id, "payload": {"name": "g"}});
        let parsed = parse_envelopes(one.to_string().as_bytes()).expect("single");
        assert_eq!(parsed.len(), 1);

        let many = serde_json::json!([one, {"type": "Freeze", "aggregate_id": id}]);
        let parsed = parse_envelopes(many.to_string().as_bytes()).expect("array");
        assert_eq!(parsed.len(), 2);

        assert!(parse_envelopes(b"not json").is_err());
        assert!(parse_envelopes(b"{\"type\": \"Freeze\"}").is_err());
    }

    #[tokio::test]
    async fn test_submit_then_verify_and_export_import() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = redb_config(dir.path());
        let id = AggregateId::new();

        let create = CommandEnvelope::new(
            id,
            &GraphCommand::CreateGraph {
                name: "cli".into(),
                graph_id: None,
            },
        )
        .expect("envelope");
        let add = CommandEnvelope::new(
            id,
            &GraphCommand::AddNode {
                label: "a".into(),
                node_id: Some(NodeId::new()),
                properties: BTreeMap::new(),
            },
        )
        .expect("envelope");
        let batch = serde_json::to_string(&vec![create, add]).expect("json");

        cmd_submit(&config, true, None, Some(&batch))
            .await
            .expect("submit");
        cmd_verify(&config, true, None).expect("verify all");
        cmd_verify(&config, false, Some(&id.to_string())).expect("verify one");
        cmd_replay(&config, true).expect("replay");

        let archive = dir.path().join("log.evog");
        cmd_export(&config, &archive).expect("export");

        let target = EvographConfig {
            storage: crate::config::StorageConfig {
                backend: BackendKind::Redb,
                path: dir.path().join("restored.db"),
            },
            ..EvographConfig::default()
        };
        cmd_import(&target, &archive).expect("import");
        let restored = target.open_session().expect("session");
        assert_eq!(restored.get_aggregate(id).expect("aggregate").version, 2);
    }

    #[tokio::test]
    async fn test_submit_requires_input() {
        let config = EvographConfig::default();
        let result = cmd_submit(&config, false, None, None).await;
        assert!(matches!(result, Err(EvographError::Validation(_))));
    }

    #[test]
    fn test_show_unknown_aggregate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = redb_config(dir.path());
        let result = cmd_show(&config, false, &AggregateId::new().to_string());
        assert!(matches!(result, Err(EvographError::AggregateNotFound(_))));
    }

    #[test]
    fn test_init_writes_config_and_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = redb_config(dir.path());
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        cmd_init(&config, Some(&config_path), false).expect("init");
        assert!(config_path.is_file());
        assert!(config.storage.path.exists());
        assert!(cmd_init(&config, Some(&config_path), false).is_err());
    }

    #[test]
    fn test_import_rejects_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = redb_config(dir.path());
        assert!(cmd_import(&config, dir.path()).is_err());
    }
}
