//! Run history ledger.
//!
//! Every orchestration appends one JSON line. Reading skips lines that no
//! longer parse so a torn write never hides the rest of the history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::{DeviceDescriptor, DeviceId, MutationResult, MutationStep, Operation};

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
    pub device_version: String,
    pub operation: Operation,
    pub success: bool,
    pub failed_step: Option<MutationStep>,
    /// Catalog code of the cause, e.g. `DSO-E200`.
    pub cause_code: Option<String>,
    pub transferred: usize,
    pub failed: usize,
    pub snapshot_id: Option<String>,
    pub duration_ms: u64,
}

impl HistoryEntry {
    pub fn from_result(result: &MutationResult, descriptor: &DeviceDescriptor) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: result.device_id.clone(),
            device_version: descriptor.software_version.clone(),
            operation: result.operation,
            success: result.success,
            failed_step: result.failed_step,
            cause_code: result.cause.map(|c| c.error_code().code_string()),
            transferred: result.transferred.len(),
            failed: result.failed.len(),
            snapshot_id: result.snapshot_id.clone(),
            duration_ms: result.elapsed_ms,
        }
    }
}

/// Append-only JSONL history file.
#[derive(Debug, Clone)]
pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening history file {}", self.path.display()))?;

        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        debug!(device = %entry.device_id, operation = %entry.operation, "Recorded run history");
        Ok(())
    }

    /// Most recent entries first, optionally for a single device.
    pub fn recent(&self, limit: usize, device: Option<&DeviceId>) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading history file {}", self.path.display()))?;
        let mut entries: Vec<HistoryEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        if let Some(device) = device {
            entries.retain(|e| &e.device_id == device);
        }

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn entry(device: &str, minutes_ago: i64, success: bool) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            device_id: DeviceId::new(device),
            device_version: "16.3.1".to_string(),
            operation: Operation::Install,
            success,
            failed_step: (!success).then_some(MutationStep::DetectingVariant),
            cause_code: (!success).then(|| "DSO-E200".to_string()),
            transferred: if success { 3 } else { 0 },
            failed: 0,
            snapshot_id: None,
            duration_ms: 1200,
        }
    }

    #[test]
    fn test_record_and_read_back_newest_first() {
        let tmp = TempDir::new().unwrap();
        let history = RunHistory::new(tmp.path().join("nested/history.jsonl"));
        history.record(&entry("a", 10, true)).unwrap();
        history.record(&entry("b", 5, false)).unwrap();
        history.record(&entry("a", 1, true)).unwrap();

        let all = history.recent(10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp > all[1].timestamp);

        let only_a = history.recent(10, Some(&DeviceId::new("a"))).unwrap();
        assert_eq!(only_a.len(), 2);

        assert_eq!(history.recent(1, None).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("history.jsonl");
        let history = RunHistory::new(&path);
        history.record(&entry("a", 2, true)).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"timestamp\": truncated\n")
            .unwrap();
        history.record(&entry("a", 1, true)).unwrap();

        assert_eq!(history.recent(10, None).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let history = RunHistory::new(tmp.path().join("none.jsonl"));
        assert!(history.recent(5, None).unwrap().is_empty());
    }
}
