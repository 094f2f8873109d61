//! Command handlers. Each one opens what it needs, acts, and prints.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use harbor_core::{EntityType, EntryState, PartitionKey, QueueEntry};
use harbor_db::{Database, DbConfig, EntryFilter};
use harbor_sync::{EntryDetail, Operator, QueueSummary, SyncAgent, SyncConfig};

/// Output mode shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

pub async fn open_database(config: &SyncConfig) -> Result<Database> {
    let path = config.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    Database::new(DbConfig::new(&path).max_connections(config.database.max_connections))
        .await
        .with_context(|| format!("Failed to open queue database at {}", path.display()))
}

pub async fn list(
    operator: &Operator,
    out: Output,
    partition: Option<String>,
    entity_type: Option<EntityType>,
    states: Vec<EntryState>,
    limit: u32,
) -> Result<()> {
    let mut filter = EntryFilter {
        partition: partition.map(PartitionKey::new),
        entity_type,
        limit,
        ..EntryFilter::default()
    };
    if !states.is_empty() {
        filter.states = states;
    }

    let entries = operator.list(&filter).await?;
    out.emit(&entries, || render_entries(&entries))
}

pub async fn show(operator: &Operator, out: Output, id: i64) -> Result<()> {
    let detail = operator.show(id).await?;
    out.emit(&detail, || render_detail(&detail))
}

pub async fn retry(operator: &Operator, out: Output, id: i64) -> Result<()> {
    operator.retry(id).await?;
    out.emit(&serde_json::json!({ "id": id, "state": "pending" }), || {
        format!("Entry {id} reset to pending")
    })
}

pub async fn skip(operator: &Operator, out: Output, id: i64, reason: &str) -> Result<()> {
    operator.skip(id, reason).await?;
    out.emit(&serde_json::json!({ "id": id, "state": "skipped" }), || {
        format!("Entry {id} skipped: {reason}")
    })
}

pub async fn summary(operator: &Operator, out: Output) -> Result<()> {
    let summary = operator.summary().await?;
    out.emit(&summary, || render_summary(&summary))
}

pub async fn reap(operator: &Operator, out: Output, stale_after: chrono::Duration) -> Result<()> {
    let reaped = operator.reap(stale_after).await?;
    out.emit(&reaped, || match reaped.len() {
        0 => "No stuck entries".to_string(),
        n => format!("Returned {n} stuck entries to pending: {reaped:?}"),
    })
}

pub async fn purge(
    db: &Database,
    operator: &Operator,
    out: Output,
    older_than: chrono::Duration,
) -> Result<()> {
    let purged = operator.purge(older_than).await?;
    if purged > 0 {
        db.checkpoint().await?;
    }
    out.emit(&serde_json::json!({ "purged": purged }), || {
        format!("Purged {purged} synced entries")
    })
}

/// Runs the agent against the configured central endpoints until Ctrl-C.
pub async fn run(config: SyncConfig, db: Database) -> Result<()> {
    let mut agent = SyncAgent::builder(config).with_database(db).build()?;
    agent.start().await?;

    let status = agent.status().await?;
    info!(
        workers = status.workers,
        outstanding = status.queue.outstanding(),
        "Sync agent running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    agent.shutdown().await?;
    Ok(())
}

// =============================================================================
// Text Rendering
// =============================================================================

fn render_entries(entries: &[QueueEntry]) -> String {
    if entries.is_empty() {
        return "No matching entries".to_string();
    }

    let mut lines = vec![format!(
        "{:>6}  {:<18}  {:<10}  {:<10}  {:>8}  {}",
        "ID", "TYPE", "STATE", "PARTITION", "ATTEMPTS", "REFERENCE"
    )];
    for entry in entries {
        lines.push(format!(
            "{:>6}  {:<18}  {:<10}  {:<10}  {:>8}  {}",
            entry.id,
            entry.entity_type.to_string(),
            entry.state.to_string(),
            entry.target_partition.to_string(),
            format!("{}/{}", entry.attempt_count, entry.max_attempts),
            entry.human_reference,
        ));
    }
    lines.join("\n")
}

fn render_detail(detail: &EntryDetail) -> String {
    let entry = &detail.entry;
    let mut lines = vec![
        format!("Entry {} ({})", entry.id, entry.human_reference),
        format!("  type:       {} {}", entry.entity_type, entry.local_record_id),
        format!("  operation:  {}", entry.operation),
        format!("  partition:  {}", entry.target_partition),
        format!("  state:      {}", entry.state),
        format!(
            "  attempts:   {}/{} ({} left{})",
            entry.attempt_count,
            entry.max_attempts,
            detail.remaining_attempts,
            if detail.frozen { ", frozen" } else { "" }
        ),
    ];
    if let Some(remote) = &entry.remote_record_id {
        lines.push(format!("  remote id:  {remote}"));
    }
    if let Some(message) = &entry.error_message {
        let kind = entry.error_kind.map(|k| k.to_string()).unwrap_or_default();
        lines.push(format!("  error:      [{kind}] {message}"));
    }
    if let Some(at) = entry.next_retry_at {
        lines.push(format!("  next retry: {}", at.to_rfc3339()));
    }
    if !entry.depends_on.is_empty() {
        lines.push(format!("  depends on: {:?}", entry.depends_on));
    } else if let Some(parent) = &entry.parent_record_id {
        lines.push(format!("  waiting on: next entry of parent {parent}"));
    }
    if let Some(at) = entry.claimed_at {
        lines.push(format!("  claimed at: {}", at.to_rfc3339()));
    }

    lines.push("  history:".to_string());
    for attempt in &detail.attempts {
        lines.push(format!(
            "    #{} {} {}{}",
            attempt.attempt_number,
            attempt.recorded_at.to_rfc3339(),
            attempt.outcome,
            attempt
                .detail
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        ));
    }
    lines.join("\n")
}

fn render_summary(summary: &QueueSummary) -> String {
    if summary.partitions.is_empty() {
        return "Queue is empty".to_string();
    }

    let mut lines = vec![format!(
        "{:<16}  {:>8}  {:>10}  {:>6}  {:>8}  {:>8}",
        "PARTITION", "PENDING", "PROCESSING", "ERROR", "SYNCED", "SKIPPED"
    )];
    for p in &summary.partitions {
        lines.push(format!(
            "{:<16}  {:>8}  {:>10}  {:>6}  {:>8}  {:>8}",
            p.partition, p.pending, p.processing, p.error, p.synced, p.skipped
        ));
    }
    lines.push(format!(
        "Outstanding: {}  Frozen: {}",
        summary.outstanding(),
        summary.frozen
    ));
    lines.join("\n")
}
