use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Event log written as JSON Lines, one file per run and day
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Serializes appends so lines from concurrent steps never interleave
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path to the event log file for a run on a given day
    /// Format: YYYY/MM/DD/<run_id>.jsonl
    fn event_log_path(&self, run_id: &RunId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl", run_id))
    }

    /// Get all event log files for a run
    fn log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let filename = format!("{}.jsonl", run_id);
        let mut files = Vec::new();

        for year in subdirectories(&self.base_path)? {
            for month in subdirectories(&year)? {
                for day in subdirectories(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }

    async fn read_jsonl(path: &Path) -> Result<Vec<Event>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read event log {}", path.display()))?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse event"))
            .collect()
    }
}

fn subdirectories(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let path = self.event_log_path(&event.run_id, &event.timestamp);
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create event log directory")?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open event log file")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event log")?;

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let mut all_events = Vec::new();
        for file in self.log_files(&run_id)? {
            all_events.extend(Self::read_jsonl(&file).await?);
        }

        // Sort by timestamp
        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }
}
