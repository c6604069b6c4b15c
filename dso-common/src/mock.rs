//! In-memory device transport for tests and offline runs.
//!
//! Each [`MockDevice`] carries a small virtual filesystem, a table of
//! attributes and a handful of scripted faults. The shell channel
//! understands just enough commands to drive the core: existence tests,
//! system identification, liveness echoes and process termination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commands::{LIVENESS, LIVENESS_REPLY, SYSTEM_IDENTITY};
use crate::paths::parent_dir;
use crate::session::{ATTR_CHIP_ID, ATTR_DEVICE_ID, ATTR_HARDWARE, ATTR_SERIAL, ATTR_VERSION};
use crate::transport::{
    AttributeValue, ChannelKind, CommandOutput, DeviceTransport, FileMeta, TransportError,
};
use crate::types::DeviceId;

const DEFAULT_UNAME: &str = "Darwin iPhone 22.4.0 Darwin Kernel Version 22.4.0: root:xnu-8796.102.5~1/RELEASE_ARM64_T8110 iPhone14,2";

/// Scripted device state.
#[derive(Debug, Clone)]
pub struct MockDevice {
    id: DeviceId,
    attributes: BTreeMap<String, AttributeValue>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    modes: BTreeMap<String, u32>,
    shell: bool,
    narrow_probe: bool,
    uname: String,
    handshake_failures: u32,
    fail_reads: BTreeSet<String>,
    fail_writes: BTreeSet<String>,
    exec_delay: Option<Duration>,
    commands: Vec<String>,
    mutations: u32,
}

impl MockDevice {
    pub fn new(id: &str, version: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_DEVICE_ID.to_string(), AttributeValue::String(id.to_string()));
        attributes.insert(ATTR_VERSION.to_string(), AttributeValue::String(version.to_string()));
        attributes.insert(
            ATTR_HARDWARE.to_string(),
            AttributeValue::String("iPhone14,2".to_string()),
        );
        attributes.insert(
            ATTR_SERIAL.to_string(),
            AttributeValue::String("F2LXK0MOCK01".to_string()),
        );
        attributes.insert(ATTR_CHIP_ID.to_string(), AttributeValue::Number(0x1a2b3c4d));

        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());

        Self {
            id: DeviceId::new(id),
            attributes,
            files: BTreeMap::new(),
            dirs,
            modes: BTreeMap::new(),
            shell: true,
            narrow_probe: true,
            uname: DEFAULT_UNAME.to_string(),
            handshake_failures: 0,
            fail_reads: BTreeSet::new(),
            fail_writes: BTreeSet::new(),
            exec_delay: None,
            commands: Vec::new(),
            mutations: 0,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Device exposes only the narrow channel.
    pub fn narrow_only(mut self) -> Self {
        self.shell = false;
        self
    }

    /// Narrow probes report `Unsupported`; existence must go through the shell.
    pub fn without_narrow_probe(mut self) -> Self {
        self.narrow_probe = false;
        self
    }

    /// Reject the next `n` handshakes.
    pub fn fail_handshakes(mut self, n: u32) -> Self {
        self.handshake_failures = n;
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn with_uname(mut self, uname: &str) -> Self {
        self.uname = uname.to_string();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: AttributeValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn without_attribute(mut self, key: &str) -> Self {
        self.attributes.remove(key);
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.add_dir_all(path);
        self
    }

    pub fn with_file(mut self, path: &str, bytes: &[u8]) -> Self {
        if let Some(parent) = parent_dir(path) {
            self.add_dir_all(parent);
        }
        self.files.insert(path.to_string(), bytes.to_vec());
        self
    }

    /// Reads of `path` fail with a transient error.
    pub fn fail_reads_for(mut self, path: &str) -> Self {
        self.fail_reads.insert(path.to_string());
        self
    }

    /// Writes to `path` fail with a transient error.
    pub fn fail_writes_for(mut self, path: &str) -> Self {
        self.fail_writes.insert(path.to_string());
        self
    }

    fn add_dir_all(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn under(path: &str, root: &str) -> bool {
        path == root || path.starts_with(&format!("{}/", root.trim_end_matches('/')))
    }

    fn run(&mut self, command: &str) -> CommandOutput {
        self.commands.push(command.to_string());
        let ok = |stdout: &str| CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };

        if let Some(rest) = command.strip_prefix("test -e ") {
            let path = unquote(rest);
            return CommandOutput {
                status: if self.exists(&path) { 0 } else { 1 },
                ..CommandOutput::default()
            };
        }
        if command == SYSTEM_IDENTITY {
            return ok(&format!("{}\n", self.uname));
        }
        if command == LIVENESS {
            return ok(&format!("{LIVENESS_REPLY}\n"));
        }
        if command.starts_with("killall ") {
            return ok("");
        }
        CommandOutput {
            status: 127,
            stdout: String::new(),
            stderr: format!("sh: {command}: command not found"),
        }
    }
}

fn unquote(arg: &str) -> String {
    arg.trim().trim_matches('\'').to_string()
}

/// Connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub open_attempts: u32,
    pub opened: u32,
    pub closed: u32,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<DeviceId, MockDevice>,
    stats: MockStats,
}

/// Handle vended by [`MockTransport`].
#[derive(Debug)]
pub struct MockHandle {
    device: DeviceId,
    shell: bool,
}

/// Transport over a set of [`MockDevice`]s. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: MockDevice) -> Self {
        self.add_device(device);
        self
    }

    pub fn add_device(&self, device: MockDevice) {
        self.lock().devices.insert(device.id.clone(), device);
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats
    }

    pub fn file(&self, device: &DeviceId, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .devices
            .get(device)
            .and_then(|d| d.files.get(path).cloned())
    }

    pub fn path_exists(&self, device: &DeviceId, path: &str) -> bool {
        self.lock()
            .devices
            .get(device)
            .is_some_and(|d| d.exists(path))
    }

    pub fn mode(&self, device: &DeviceId, path: &str) -> Option<u32> {
        self.lock()
            .devices
            .get(device)
            .and_then(|d| d.modes.get(path).copied())
    }

    /// Every directory and file on the device with its contents, sorted.
    pub fn tree(&self, device: &DeviceId) -> Vec<(String, Option<Vec<u8>>)> {
        let state = self.lock();
        let Some(d) = state.devices.get(device) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = d
            .dirs
            .iter()
            .map(|dir| (dir.clone(), None))
            .chain(d.files.iter().map(|(p, b)| (p.clone(), Some(b.clone()))))
            .collect();
        entries.sort();
        entries
    }

    /// Shell commands the device has received, in order.
    pub fn commands(&self, device: &DeviceId) -> Vec<String> {
        self.lock()
            .devices
            .get(device)
            .map(|d| d.commands.clone())
            .unwrap_or_default()
    }

    /// Number of write, delete, mkdir and chmod calls that reached the device.
    pub fn mutation_count(&self, device: &DeviceId) -> u32 {
        self.lock()
            .devices
            .get(device)
            .map(|d| d.mutations)
            .unwrap_or_default()
    }

    /// Overwrite a file outside the transport, creating parents.
    pub fn put_file(&self, device: &DeviceId, path: &str, bytes: &[u8]) {
        let mut state = self.lock();
        if let Some(d) = state.devices.get_mut(device) {
            if let Some(parent) = parent_dir(path) {
                d.add_dir_all(parent);
            }
            d.files.insert(path.to_string(), bytes.to_vec());
        }
    }

    pub fn remove_path(&self, device: &DeviceId, path: &str) {
        let mut state = self.lock();
        if let Some(d) = state.devices.get_mut(device) {
            d.files.remove(path);
            d.dirs.remove(path);
        }
    }

    pub fn set_fail_writes(&self, device: &DeviceId, path: &str) {
        let mut state = self.lock();
        if let Some(d) = state.devices.get_mut(device) {
            d.fail_writes.insert(path.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport mutex poisoned")
    }

    fn with_device_state<R>(
        &self,
        device: &DeviceId,
        f: impl FnOnce(&mut MockDevice) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = self.lock();
        let d = state
            .devices
            .get_mut(device)
            .ok_or_else(|| TransportError::TransientIo(format!("device {device} went away")))?;
        f(d)
    }

    fn require_shell(handle: &MockHandle, operation: &'static str) -> Result<(), TransportError> {
        if handle.shell {
            Ok(())
        } else {
            Err(TransportError::Unsupported {
                operation,
                channel: ChannelKind::Shell,
            })
        }
    }
}

impl DeviceTransport for MockTransport {
    type Handle = MockHandle;

    async fn list_devices(&self) -> Result<Vec<DeviceId>, TransportError> {
        Ok(self.lock().devices.keys().cloned().collect())
    }

    async fn open_channel(&self, device: &DeviceId) -> Result<MockHandle, TransportError> {
        let mut state = self.lock();
        state.stats.open_attempts += 1;
        let shell = match state.devices.get(device) {
            Some(d) => d.shell,
            None => return Err(TransportError::DeviceNotFound(device.to_string())),
        };
        state.stats.opened += 1;
        Ok(MockHandle {
            device: device.clone(),
            shell,
        })
    }

    async fn handshake(&self, handle: &mut MockHandle) -> Result<(), TransportError> {
        self.with_device_state(&handle.device, |d| {
            if d.handshake_failures > 0 {
                d.handshake_failures -= 1;
                Err(TransportError::HandshakeRejected(
                    "pairing dialog not acknowledged".to_string(),
                ))
            } else {
                Ok(())
            }
        })
    }

    async fn close(&self, _handle: MockHandle) {
        self.lock().stats.closed += 1;
    }

    async fn read_attribute(
        &self,
        handle: &MockHandle,
        key: &str,
        _domain: Option<&str>,
    ) -> Result<Option<AttributeValue>, TransportError> {
        self.with_device_state(&handle.device, |d| Ok(d.attributes.get(key).cloned()))
    }

    async fn probe(&self, handle: &MockHandle, path: &str) -> Result<Option<FileMeta>, TransportError> {
        self.with_device_state(&handle.device, |d| {
            if !d.narrow_probe {
                return Err(TransportError::Unsupported {
                    operation: "probe",
                    channel: ChannelKind::Narrow,
                });
            }
            if let Some(bytes) = d.files.get(path) {
                return Ok(Some(FileMeta {
                    is_dir: false,
                    size: bytes.len() as u64,
                    mode: d.modes.get(path).copied(),
                }));
            }
            if d.dirs.contains(path) {
                return Ok(Some(FileMeta {
                    is_dir: true,
                    size: 0,
                    mode: d.modes.get(path).copied(),
                }));
            }
            Ok(None)
        })
    }

    fn has_shell(&self, handle: &MockHandle) -> bool {
        handle.shell
    }

    async fn exec(&self, handle: &MockHandle, command: &str) -> Result<CommandOutput, TransportError> {
        Self::require_shell(handle, "exec")?;
        let delay = self.with_device_state(&handle.device, |d| Ok(d.exec_delay))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_device_state(&handle.device, |d| Ok(d.run(command)))
    }

    async fn download(&self, handle: &MockHandle, path: &str) -> Result<Vec<u8>, TransportError> {
        Self::require_shell(handle, "download")?;
        self.with_device_state(&handle.device, |d| {
            if d.fail_reads.contains(path) {
                return Err(TransportError::TransientIo(format!("read of {path} interrupted")));
            }
            match d.files.get(path) {
                Some(bytes) => Ok(bytes.clone()),
                None if d.dirs.contains(path) => Err(TransportError::CommandFailed {
                    status: 1,
                    stderr: format!("cat: {path}: Is a directory"),
                }),
                None => Err(TransportError::NotFound(path.to_string())),
            }
        })
    }

    async fn upload(&self, handle: &MockHandle, path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        Self::require_shell(handle, "upload")?;
        self.with_device_state(&handle.device, |d| {
            d.mutations += 1;
            if d.fail_writes.contains(path) {
                return Err(TransportError::TransientIo(format!("write of {path} interrupted")));
            }
            match parent_dir(path) {
                Some(parent) if !d.dirs.contains(parent) => {
                    return Err(TransportError::NotFound(parent.to_string()));
                }
                _ => {}
            }
            d.files.insert(path.to_string(), bytes.to_vec());
            Ok(())
        })
    }

    async fn delete(&self, handle: &MockHandle, path: &str) -> Result<(), TransportError> {
        Self::require_shell(handle, "delete")?;
        self.with_device_state(&handle.device, |d| {
            d.mutations += 1;
            if !d.exists(path) {
                return Err(TransportError::NotFound(path.to_string()));
            }
            d.files.retain(|p, _| !MockDevice::under(p, path));
            d.dirs.retain(|p| !MockDevice::under(p, path));
            d.modes.retain(|p, _| !MockDevice::under(p, path));
            Ok(())
        })
    }

    async fn mkdir_all(&self, handle: &MockHandle, path: &str) -> Result<(), TransportError> {
        Self::require_shell(handle, "mkdir")?;
        self.with_device_state(&handle.device, |d| {
            d.mutations += 1;
            if d.files.contains_key(path) {
                return Err(TransportError::CommandFailed {
                    status: 1,
                    stderr: format!("mkdir: {path}: File exists"),
                });
            }
            d.add_dir_all(path);
            Ok(())
        })
    }

    async fn chmod(
        &self,
        handle: &MockHandle,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), TransportError> {
        Self::require_shell(handle, "chmod")?;
        self.with_device_state(&handle.device, |d| {
            d.mutations += 1;
            if !d.exists(path) {
                return Err(TransportError::NotFound(path.to_string()));
            }
            let targets: Vec<String> = if recursive {
                d.files
                    .keys()
                    .chain(d.dirs.iter())
                    .filter(|p| MockDevice::under(p, path))
                    .cloned()
                    .collect()
            } else {
                vec![path.to_string()]
            };
            for target in targets {
                d.modes.insert(target, mode);
            }
            Ok(())
        })
    }
}
