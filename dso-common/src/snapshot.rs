//! Pre-mutation snapshots on local storage.
//!
//! Layout, one directory per snapshot under the store root:
//!
//! ```text
//! <root>/<device>-<YYYYMMDDTHHMMSSmmmZ>/
//!     manifest.json
//!     activation-record.blob
//!     setup-prefs.blob
//! ```
//!
//! Each stored file is named after its logical name, so a snapshot whose
//! manifest was lost can still be restored by mapping file stems back
//! through the device's current [`PathSet`]. The manifest is written last
//! and synced before `capture` returns.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::ErrorCode;
use crate::paths::parent_dir;
use crate::session::Session;
use crate::transport::DeviceTransport;
use crate::types::{DeviceId, LogicalName, MutationCause, PathSet, Variant};
use crate::util::{is_safe_component, sanitize_id};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BLOB_EXTENSION: &str = "blob";
pub const MANIFEST_FORMAT: u32 = 1;

const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot manifest {path} is invalid: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot {0} has no manifest")]
    ManifestMissing(String),

    #[error("nothing could be captured from {device} ({} warnings)", warnings.len())]
    NothingCaptured {
        device: DeviceId,
        warnings: Vec<String>,
    },

    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("snapshot {snapshot} belongs to {expected}, not {actual}")]
    DeviceMismatch {
        snapshot: String,
        expected: DeviceId,
        actual: DeviceId,
    },
}

impl SnapshotError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::SnapshotPersistFailed,
            Self::Manifest { .. } | Self::ManifestMissing(_) => ErrorCode::SnapshotManifestMissing,
            Self::NothingCaptured { .. } => ErrorCode::SnapshotUnavailable,
            Self::NotFound(_) => ErrorCode::SnapshotNotFound,
            Self::DeviceMismatch { .. } => ErrorCode::SnapshotRestoreFailed,
        }
    }

    pub fn cause(&self) -> MutationCause {
        match self {
            Self::NotFound(_) => MutationCause::SnapshotNotFound,
            _ => MutationCause::SnapshotUnavailable,
        }
    }
}

/// What was found at a path when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Captured { size: u64, blake3: String },
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub logical: LogicalName,
    pub path: String,
    #[serde(flatten)]
    pub state: EntryState,
}

impl SnapshotEntry {
    pub fn is_captured(&self) -> bool {
        matches!(self.state, EntryState::Captured { .. })
    }
}

/// Snapshot manifest. Never modified once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    pub id: String,
    pub device_id: DeviceId,
    pub device_version: String,
    pub variant: Option<Variant>,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn captured_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_captured()).count()
    }

    pub fn absent_count(&self) -> usize {
        self.entries.len() - self.captured_count()
    }
}

/// Outcome of [`SnapshotStore::capture`].
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub snapshot: Snapshot,
    /// Per-file read problems that did not stop the capture.
    pub warnings: Vec<String>,
    /// Logical names that could not be read at all.
    pub failed: Vec<LogicalName>,
}

impl CaptureReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// One row of [`SnapshotStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub id: String,
    /// Sanitized device prefix of the id.
    pub device_key: String,
    pub device_id: Option<DeviceId>,
    pub device_version: Option<String>,
    pub variant: Option<Variant>,
    pub created_at: DateTime<Utc>,
    pub captured: usize,
    pub absent: usize,
    pub has_manifest: bool,
    pub path: PathBuf,
}

/// Per-file result of a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored { path: String },
    /// The file did not exist at capture time and is absent again.
    RemovedAbsent { path: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl RestoreOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreItem {
    /// Name of the stored file, or the logical name for absent entries.
    pub stored_name: String,
    pub logical: Option<LogicalName>,
    pub outcome: RestoreOutcome,
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.*)-(\d{8}T\d{9}Z)(?:-\d+)?$").expect("snapshot id pattern is valid")
    })
}

/// Split a snapshot id into its device prefix and timestamp.
pub fn parse_snapshot_id(id: &str) -> Option<(String, DateTime<Utc>)> {
    let caps = id_pattern().captures(id)?;
    let naive = NaiveDateTime::parse_from_str(&caps[2], ID_TIME_FORMAT).ok()?;
    Some((caps[1].to_string(), naive.and_utc()))
}

pub fn blob_file_name(name: LogicalName) -> String {
    format!("{}.{BLOB_EXTENSION}", name.as_str())
}

fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut file = fs::File::create(path).map_err(|e| SnapshotError::io(path, e))?;
    file.write_all(bytes).map_err(|e| SnapshotError::io(path, e))?;
    file.sync_all().map_err(|e| SnapshotError::io(path, e))
}

/// Directory-backed snapshot storage.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, id: &str) -> Result<PathBuf, SnapshotError> {
        if !is_safe_component(id) {
            return Err(SnapshotError::NotFound(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    /// Pick an unused id for a snapshot of `device` taken at `at`.
    pub fn allocate_id(&self, device: &DeviceId, at: DateTime<Utc>) -> String {
        let base = format!("{}-{}", sanitize_id(device.as_str()), at.format(ID_TIME_FORMAT));
        if !self.root.join(&base).exists() {
            return base;
        }
        (1u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.root.join(candidate).exists())
            .unwrap_or(base)
    }

    /// Write blobs then the manifest for `snapshot`.
    pub fn persist(
        &self,
        snapshot: &Snapshot,
        blobs: &BTreeMap<LogicalName, Vec<u8>>,
    ) -> Result<PathBuf, SnapshotError> {
        let dir = self.dir_for(&snapshot.id)?;
        fs::create_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;

        for (name, bytes) in blobs {
            write_durable(&dir.join(blob_file_name(*name)), bytes)?;
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(snapshot).map_err(|source| SnapshotError::Manifest {
            path: manifest_path.clone(),
            source,
        })?;
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        write_durable(&tmp, &json)?;
        fs::rename(&tmp, &manifest_path).map_err(|e| SnapshotError::io(&manifest_path, e))?;

        debug!(snapshot = %snapshot.id, dir = %dir.display(), "Snapshot persisted");
        Ok(dir)
    }

    /// Read every requested path from the device and persist the result.
    ///
    /// Missing files are recorded as absent. Other read failures become
    /// warnings. Fails only when no entry at all could be recorded, or when
    /// the snapshot cannot be written locally.
    pub async fn capture<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        paths: &PathSet,
        names: &[LogicalName],
    ) -> Result<CaptureReport, SnapshotError> {
        let descriptor = session.descriptor();
        let mut warnings = Vec::new();
        let mut failed = Vec::new();

        let mut targets = Vec::new();
        for name in names {
            match paths.path(*name) {
                Some(path) => targets.push((*name, path.to_string())),
                None => {
                    warnings.push(format!("{name}: no path for this version/variant"));
                    failed.push(*name);
                }
            }
        }

        let reads = join_all(
            targets
                .iter()
                .map(|(_, path)| async move { session.read_file(path).await }),
        )
        .await;

        let mut entries = Vec::new();
        let mut blobs = BTreeMap::new();
        for ((name, path), read) in targets.into_iter().zip(reads) {
            match read {
                Ok(bytes) => {
                    debug!(logical_name = %name, path, size = bytes.len(), "Captured");
                    entries.push(SnapshotEntry {
                        logical: name,
                        path,
                        state: EntryState::Captured {
                            size: bytes.len() as u64,
                            blake3: hash_hex(&bytes),
                        },
                    });
                    blobs.insert(name, bytes);
                }
                Err(err) if err.is_not_found() => {
                    debug!(logical_name = %name, path, "Absent at capture time");
                    entries.push(SnapshotEntry {
                        logical: name,
                        path,
                        state: EntryState::Absent,
                    });
                }
                Err(err) => {
                    warn!(logical_name = %name, path, error = %err, "Capture read failed");
                    warnings.push(format!("{name}: capture failed: {err}"));
                    failed.push(name);
                }
            }
        }

        if entries.is_empty() {
            return Err(SnapshotError::NothingCaptured {
                device: descriptor.id.clone(),
                warnings,
            });
        }

        let created_at = Utc::now();
        let snapshot = Snapshot {
            format: MANIFEST_FORMAT,
            id: self.allocate_id(&descriptor.id, created_at),
            device_id: descriptor.id.clone(),
            device_version: descriptor.software_version.clone(),
            variant: Some(paths.variant),
            created_at,
            entries,
        };
        self.persist(&snapshot, &blobs)?;

        info!(
            device = %descriptor.id,
            snapshot = %snapshot.id,
            captured = snapshot.captured_count(),
            absent = snapshot.absent_count(),
            failed = failed.len(),
            "Snapshot captured"
        );
        Ok(CaptureReport {
            snapshot,
            warnings,
            failed,
        })
    }

    /// Load a snapshot manifest.
    pub fn load(&self, id: &str) -> Result<Snapshot, SnapshotError> {
        let dir = self.dir_for(id)?;
        if !dir.is_dir() {
            return Err(SnapshotError::NotFound(id.to_string()));
        }
        let path = dir.join(MANIFEST_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::ManifestMissing(id.to_string()));
            }
            Err(e) => return Err(SnapshotError::io(&path, e)),
        };
        serde_json::from_slice(&raw).map_err(|source| SnapshotError::Manifest { path, source })
    }

    /// All snapshots, most recent first.
    pub fn list(&self) -> Result<Vec<SnapshotSummary>, SnapshotError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let read = fs::read_dir(&self.root).map_err(|e| SnapshotError::io(&self.root, e))?;

        let mut summaries = Vec::new();
        for entry in read.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !is_safe_component(&id) {
                continue;
            }
            summaries.push(self.summarize(&id, path));
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(summaries)
    }

    fn summarize(&self, id: &str, path: PathBuf) -> SnapshotSummary {
        let parsed = parse_snapshot_id(id);
        let device_key = parsed
            .as_ref()
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| id.to_string());

        match self.load(id) {
            Ok(snapshot) => SnapshotSummary {
                id: id.to_string(),
                device_key,
                captured: snapshot.captured_count(),
                absent: snapshot.absent_count(),
                device_id: Some(snapshot.device_id),
                device_version: Some(snapshot.device_version),
                variant: snapshot.variant,
                created_at: snapshot.created_at,
                has_manifest: true,
                path,
            },
            Err(err) => {
                debug!(snapshot = id, error = %err, "Listing snapshot without manifest");
                let created_at = parsed
                    .map(|(_, at)| at)
                    .or_else(|| {
                        fs::metadata(&path)
                            .and_then(|m| m.modified())
                            .ok()
                            .map(DateTime::<Utc>::from)
                    })
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                SnapshotSummary {
                    id: id.to_string(),
                    device_key,
                    device_id: None,
                    device_version: None,
                    variant: None,
                    created_at,
                    captured: stored_blobs(&path).len(),
                    absent: 0,
                    has_manifest: false,
                    path,
                }
            }
        }
    }

    /// Keep the `keep` most recent snapshots and delete the rest.
    ///
    /// Returns the ids that were deleted. Deletion failures are logged.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>, SnapshotError> {
        self.prune_matching(None, keep)
    }

    /// Like [`prune`](Self::prune) but only considers snapshots of `device`.
    pub fn prune_device(&self, device: &DeviceId, keep: usize) -> Result<Vec<String>, SnapshotError> {
        self.prune_matching(Some(device), keep)
    }

    fn prune_matching(
        &self,
        device: Option<&DeviceId>,
        keep: usize,
    ) -> Result<Vec<String>, SnapshotError> {
        let key = device.map(|d| sanitize_id(d.as_str()));
        let candidates: Vec<SnapshotSummary> = self
            .list()?
            .into_iter()
            .filter(|s| match (&key, device) {
                (Some(key), Some(device)) => {
                    s.device_id.as_ref() == Some(device) || &s.device_key == key
                }
                _ => true,
            })
            .collect();

        let mut deleted = Vec::new();
        for summary in candidates.into_iter().skip(keep) {
            match fs::remove_dir_all(&summary.path) {
                Ok(()) => {
                    info!(snapshot = %summary.id, "Pruned snapshot");
                    deleted.push(summary.id);
                }
                Err(err) => {
                    warn!(
                        snapshot = %summary.id,
                        error = %err,
                        code = %ErrorCode::SnapshotPruneFailed.code_string(),
                        "Failed to prune snapshot"
                    );
                }
            }
        }
        Ok(deleted)
    }

    pub fn delete(&self, id: &str) -> Result<(), SnapshotError> {
        let dir = self.dir_for(id)?;
        if !dir.is_dir() {
            return Err(SnapshotError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;
        info!(snapshot = id, "Deleted snapshot");
        Ok(())
    }

    /// Write a snapshot back to the device.
    ///
    /// With a manifest, each entry goes back to the path it was captured
    /// from and entries recorded as absent are deleted. Without one, every
    /// stored file whose name maps to a logical name in `paths` is written
    /// back; other files are skipped.
    pub async fn restore<T: DeviceTransport>(
        &self,
        session: &Session<T>,
        paths: &PathSet,
        id: &str,
    ) -> Result<Vec<RestoreItem>, SnapshotError> {
        let dir = self.dir_for(id)?;
        if !dir.is_dir() {
            return Err(SnapshotError::NotFound(id.to_string()));
        }

        let mut items = Vec::new();
        match self.load(id) {
            Ok(snapshot) => {
                if &snapshot.device_id != session.device_id() {
                    return Err(SnapshotError::DeviceMismatch {
                        snapshot: id.to_string(),
                        expected: snapshot.device_id,
                        actual: session.device_id().clone(),
                    });
                }
                for entry in &snapshot.entries {
                    items.push(restore_entry(session, &dir, entry).await);
                }
            }
            Err(SnapshotError::ManifestMissing(_)) | Err(SnapshotError::Manifest { .. }) => {
                warn!(snapshot = id, "Manifest unavailable; restoring by stored file names");
                for (stored_name, file) in stored_blobs(&dir) {
                    items.push(restore_unmanifested(session, paths, stored_name, &file).await);
                }
            }
            Err(err) => return Err(err),
        }

        let failed = items.iter().filter(|i| i.outcome.is_failure()).count();
        info!(
            device = %session.device_id(),
            snapshot = id,
            items = items.len(),
            failed,
            "Restore finished"
        );
        Ok(items)
    }
}

/// `(stored name, path)` of every blob in a snapshot directory, sorted.
fn stored_blobs(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut blobs: Vec<(String, PathBuf)> = read
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(BLOB_EXTENSION))
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?.to_string();
            Some((name, p))
        })
        .collect();
    blobs.sort();
    blobs
}

async fn write_back<T: DeviceTransport>(
    session: &Session<T>,
    path: &str,
    bytes: &[u8],
) -> RestoreOutcome {
    if let Some(parent) = parent_dir(path)
        && let Err(err) = session.create_dir_all(parent).await
    {
        return RestoreOutcome::Failed {
            reason: format!("creating {parent}: {err}"),
        };
    }
    match session.write_file(path, bytes).await {
        Ok(()) => RestoreOutcome::Restored {
            path: path.to_string(),
        },
        Err(err) => RestoreOutcome::Failed {
            reason: format!("writing {path}: {err}"),
        },
    }
}

async fn restore_entry<T: DeviceTransport>(
    session: &Session<T>,
    dir: &Path,
    entry: &SnapshotEntry,
) -> RestoreItem {
    let stored_name = blob_file_name(entry.logical);
    let outcome = match &entry.state {
        EntryState::Absent => match session.remove(&entry.path).await {
            Ok(()) => RestoreOutcome::RemovedAbsent {
                path: entry.path.clone(),
            },
            Err(err) if err.is_not_found() => RestoreOutcome::RemovedAbsent {
                path: entry.path.clone(),
            },
            Err(err) => RestoreOutcome::Failed {
                reason: format!("removing {}: {err}", entry.path),
            },
        },
        EntryState::Captured { blake3, .. } => match fs::read(dir.join(&stored_name)) {
            Ok(bytes) if &hash_hex(&bytes) != blake3 => RestoreOutcome::Failed {
                reason: format!("{stored_name} does not match its recorded checksum"),
            },
            Ok(bytes) => write_back(session, &entry.path, &bytes).await,
            Err(err) => RestoreOutcome::Failed {
                reason: format!("reading {stored_name}: {err}"),
            },
        },
    };
    log_outcome(entry.logical, &outcome);
    RestoreItem {
        stored_name,
        logical: Some(entry.logical),
        outcome,
    }
}

async fn restore_unmanifested<T: DeviceTransport>(
    session: &Session<T>,
    paths: &PathSet,
    stored_name: String,
    file: &Path,
) -> RestoreItem {
    let logical = file
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<LogicalName>().ok());
    let target = logical.and_then(|name| paths.path(name).map(str::to_string));

    let outcome = match (logical, target) {
        (Some(_), Some(path)) => match fs::read(file) {
            Ok(bytes) => write_back(session, &path, &bytes).await,
            Err(err) => RestoreOutcome::Failed {
                reason: format!("reading {stored_name}: {err}"),
            },
        },
        _ => {
            warn!(stored = %stored_name, "Stored file does not map to a known path; skipping");
            RestoreOutcome::Skipped {
                reason: format!("{stored_name} does not map to a known path"),
            }
        }
    };
    if let Some(name) = logical {
        log_outcome(name, &outcome);
    }
    RestoreItem {
        stored_name,
        logical,
        outcome,
    }
}

fn log_outcome(name: LogicalName, outcome: &RestoreOutcome) {
    match outcome {
        RestoreOutcome::Failed { reason } => warn!(logical_name = %name, reason, "Restore failed"),
        other => debug!(logical_name = %name, outcome = ?other, "Restored entry"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn snapshot_at(store: &SnapshotStore, device: &str, minute: u32) -> Snapshot {
        let created_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap();
        let device_id = DeviceId::new(device);
        Snapshot {
            format: MANIFEST_FORMAT,
            id: store.allocate_id(&device_id, created_at),
            device_id,
            device_version: "16.3.1".to_string(),
            variant: Some(Variant::Relocated),
            created_at,
            entries: vec![SnapshotEntry {
                logical: LogicalName::ActivationRecord,
                path: "/var/jb/var/a.plist".to_string(),
                state: EntryState::Captured {
                    size: 3,
                    blake3: hash_hex(b"abc"),
                },
            }],
        }
    }

    fn persist(store: &SnapshotStore, snapshot: &Snapshot) {
        let mut blobs = BTreeMap::new();
        blobs.insert(LogicalName::ActivationRecord, b"abc".to_vec());
        store.persist(snapshot, &blobs).unwrap();
    }

    #[test]
    fn test_prune_keeps_five_most_recent_of_eight() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let mut ids = Vec::new();
        for minute in 0..8 {
            let snap = snapshot_at(&store, "dev-a", minute);
            persist(&store, &snap);
            ids.push(snap.id);
        }

        let deleted = store.prune(5).unwrap();
        assert_eq!(deleted.len(), 3);
        for oldest in &ids[..3] {
            assert!(deleted.contains(oldest));
        }

        let remaining: Vec<String> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        let mut expected: Vec<String> = ids[3..].to_vec();
        expected.reverse();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn test_prune_device_leaves_other_devices() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        for minute in 0..3 {
            persist(&store, &snapshot_at(&store, "dev-a", minute));
        }
        persist(&store, &snapshot_at(&store, "dev-b", 0));

        let deleted = store.prune_device(&DeviceId::new("dev-a"), 1).unwrap();
        assert_eq!(deleted.len(), 2);
        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|s| s.device_key == "dev-b"));
    }

    #[test]
    fn test_id_collision_appends_counter() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let first = snapshot_at(&store, "dev-a", 7);
        persist(&store, &first);
        let second = snapshot_at(&store, "dev-a", 7);
        assert_eq!(second.id, format!("{}-1", first.id));

        let (key, at) = parse_snapshot_id(&second.id).unwrap();
        assert_eq!(key, "dev-a");
        assert_eq!(at, first.created_at);
    }

    #[test]
    fn test_list_tolerates_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let snap = snapshot_at(&store, "dev-a", 1);
        persist(&store, &snap);
        fs::remove_file(tmp.path().join(&snap.id).join(MANIFEST_FILE)).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].has_manifest);
        assert_eq!(list[0].created_at, snap.created_at);
        assert_eq!(list[0].captured, 1);
        assert!(matches!(
            store.load(&snap.id),
            Err(SnapshotError::ManifestMissing(_))
        ));
    }

    #[test]
    fn test_delete_and_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let snap = snapshot_at(&store, "dev-a", 2);
        persist(&store, &snap);

        store.delete(&snap.id).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.delete(&snap.id), Err(SnapshotError::NotFound(_))));
        assert!(matches!(store.delete("../escape"), Err(SnapshotError::NotFound(_))));
    }

    #[test]
    fn test_manifest_round_trips_through_load() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let snap = snapshot_at(&store, "root@10.0.0.2", 3);
        persist(&store, &snap);
        assert!(snap.id.starts_with("root_10.0.0.2-"));
        assert_eq!(store.load(&snap.id).unwrap(), snap);
    }

    #[test]
    fn test_empty_root_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("missing"));
        assert!(store.list().unwrap().is_empty());
        assert!(store.prune(5).unwrap().is_empty());
    }
}
