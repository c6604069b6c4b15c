//! Replacement artifact sources.
//!
//! The orchestrator never builds artifact contents itself. It asks an
//! [`ArtifactSource`] for bytes keyed by logical name; a name the source
//! cannot provide is simply left out of the returned map.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{DeviceDescriptor, LogicalName};
use crate::util::sanitize_id;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact directory {0} does not exist")]
    MissingDirectory(PathBuf),
}

/// Supplies replacement bytes for a device.
pub trait ArtifactSource {
    /// Bytes for each requested name this source can provide.
    fn for_artifacts(
        &self,
        descriptor: &DeviceDescriptor,
        names: &[LogicalName],
    ) -> BTreeMap<LogicalName, Vec<u8>>;
}

/// Artifacts read from a directory.
///
/// For a device `D` and logical name `N` the source looks for `<root>/D/N`
/// first and falls back to `<root>/N`, so per-device overrides can sit next
/// to shared defaults.
#[derive(Debug, Clone)]
pub struct DirArtifactSource {
    root: PathBuf,
}

impl DirArtifactSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ArtifactError::MissingDirectory(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, descriptor: &DeviceDescriptor, name: LogicalName) -> [PathBuf; 2] {
        [
            self.root
                .join(sanitize_id(descriptor.id.as_str()))
                .join(name.as_str()),
            self.root.join(name.as_str()),
        ]
    }
}

impl ArtifactSource for DirArtifactSource {
    fn for_artifacts(
        &self,
        descriptor: &DeviceDescriptor,
        names: &[LogicalName],
    ) -> BTreeMap<LogicalName, Vec<u8>> {
        let mut found = BTreeMap::new();
        for name in names {
            for candidate in self.candidates(descriptor, *name) {
                match fs::read(&candidate) {
                    Ok(bytes) => {
                        debug!(logical_name = %name, file = %candidate.display(), "Loaded artifact");
                        found.insert(*name, bytes);
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        warn!(logical_name = %name, file = %candidate.display(), error = %err, "Unreadable artifact");
                        break;
                    }
                }
            }
        }
        found
    }
}

/// Fixed in-memory artifacts, the same for every device.
#[derive(Debug, Clone, Default)]
pub struct MapArtifactSource {
    artifacts: BTreeMap<LogicalName, Vec<u8>>,
}

impl MapArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: LogicalName, bytes: impl Into<Vec<u8>>) -> Self {
        self.artifacts.insert(name, bytes.into());
        self
    }
}

impl ArtifactSource for MapArtifactSource {
    fn for_artifacts(
        &self,
        _descriptor: &DeviceDescriptor,
        names: &[LogicalName],
    ) -> BTreeMap<LogicalName, Vec<u8>> {
        names
            .iter()
            .filter_map(|name| self.artifacts.get(name).map(|b| (*name, b.clone())))
            .collect()
    }
}
