//! Append-only flow journal with file-based persistence.
//!
//! Each execution gets `<base>/<execution_id>/events.jsonl`, one JSON event
//! per line, readable with any line-oriented tool.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::{FlowEvent, FlowExecution};

/// File-based journal for one flow execution
#[derive(Debug, Clone)]
pub struct FlowJournal {
    execution_dir: PathBuf,
    events_path: PathBuf,
}

impl FlowJournal {
    /// Create or open the journal of an execution under `base_dir`
    pub async fn open(base_dir: &Path, execution_id: Uuid) -> Result<Self> {
        let execution_dir = base_dir.join(execution_id.to_string());
        fs::create_dir_all(&execution_dir).await.with_context(|| {
            format!(
                "Failed to create journal directory: {}",
                execution_dir.display()
            )
        })?;

        Ok(Self {
            events_path: execution_dir.join("events.jsonl"),
            execution_dir,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn execution_dir(&self) -> &Path {
        &self.execution_dir
    }

    /// Append an event under an exclusive file lock
    pub async fn append(&self, event: &FlowEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        let path = self.events_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open events file: {}", path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire file lock on events.jsonl")?;
            writeln!(file, "{}", json).context("Failed to write event")?;
            file.flush().context("Failed to flush event")?;

            // Lock is released when file is dropped
            Ok(())
        })
        .await
        .context("Journal writer panicked")?
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<FlowEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: FlowEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rebuild the execution record from the journal
    pub async fn execution(&self) -> Result<Option<FlowExecution>> {
        let events = self.replay().await?;
        Ok(FlowExecution::from_events(&events))
    }
}

/// List all execution IDs journaled under `base_dir`
pub async fn list_executions(base_dir: &Path) -> Result<Vec<Uuid>> {
    if !base_dir.exists() {
        return Ok(Vec::new());
    }

    let mut executions = Vec::new();
    let mut entries = fs::read_dir(base_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    executions.push(id);
                }
            }
        }
    }

    executions.sort();
    Ok(executions)
}

/// Generate an idempotency key for a task invocation
pub fn generate_idempotency_key(execution_id: Uuid, node: &str, input: &str) -> String {
    format!("{}:{}:{}", execution_id, node, hash_input(input))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
