//! Device transport over SSH.
//!
//! Devices reachable over SSH expose only a shell channel; the narrow probe
//! is emulated with `stat`. Every call runs a fixed command built in
//! [`dso_common::commands`], so quoting happens in one place.

use std::process::Output;
use std::time::Duration;

use dso_common::commands::{self, LIVENESS, LIVENESS_REPLY, NOT_FOUND_STATUS};
use dso_common::session::{ATTR_CHIP_ID, ATTR_DEVICE_ID, ATTR_HARDWARE, ATTR_SERIAL, ATTR_VERSION};
use dso_common::{
    AttributeValue, CommandOutput, DeviceConfig, DeviceId, DeviceTransport, FileMeta,
    TransportError,
};
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Read-only commands answering attribute queries.
const ATTRIBUTE_COMMANDS: &[(&str, &str)] = &[
    (ATTR_VERSION, "sw_vers -productVersion"),
    (ATTR_HARDWARE, "uname -m"),
    (
        ATTR_SERIAL,
        "ioreg -rd1 -c IOPlatformExpertDevice | sed -n 's/.*\"IOPlatformSerialNumber\" = \"\\(.*\\)\"/\\1/p'",
    ),
    (
        ATTR_CHIP_ID,
        "ioreg -rd1 -c IOPlatformExpertDevice | sed -n 's/.*\"unique-chip-id\" = <\\(.*\\)>/\\1/p'",
    ),
];

fn attribute_command(key: &str) -> Option<&'static str> {
    ATTRIBUTE_COMMANDS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, cmd)| *cmd)
}

/// Map an SSH connection failure onto the transport taxonomy.
fn classify_connect_error(message: &str) -> TransportError {
    let lower = message.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
    {
        TransportError::HandshakeRejected(message.to_string())
    } else if lower.contains("could not resolve hostname") || lower.contains("no route to host") {
        TransportError::DeviceNotFound(message.to_string())
    } else {
        TransportError::TransientIo(message.to_string())
    }
}

fn command_output(output: &Output) -> CommandOutput {
    CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

fn failed(output: &Output) -> TransportError {
    TransportError::CommandFailed {
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn missing_target(output: &Output) -> bool {
    output.status.code() == Some(NOT_FOUND_STATUS)
        || String::from_utf8_lossy(&output.stderr).contains("No such file or directory")
}

/// Interpret a `stat` reply. Only a missing target counts as absent; a
/// permission or I/O failure stays an error so it is never read as a
/// missing marker.
fn stat_outcome(output: &Output) -> Result<Option<FileMeta>, TransportError> {
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        return commands::parse_stat(&stdout)
            .map(Some)
            .ok_or_else(|| TransportError::CommandFailed {
                status: 0,
                stderr: format!("unparsable stat output: {}", stdout.trim()),
            });
    }
    if missing_target(output) {
        Ok(None)
    } else {
        Err(failed(output))
    }
}

/// Open SSH connection to one configured device.
pub struct SshHandle {
    id: DeviceId,
    device: DeviceConfig,
    session: Option<Session>,
}

impl SshHandle {
    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or_else(|| {
            TransportError::TransientIo(format!("{} is not connected", self.id))
        })
    }
}

/// Transport over the devices listed in the config file.
#[derive(Debug, Clone)]
pub struct SshTransport {
    devices: Vec<DeviceConfig>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(devices: Vec<DeviceConfig>, connect_timeout: Duration) -> Self {
        Self {
            devices,
            connect_timeout,
        }
    }

    fn config_for(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| &d.device_id() == id)
    }

    async fn raw(&self, handle: &SshHandle, command: &str) -> Result<Output, TransportError> {
        debug!(device = %handle.id, command, "ssh exec");
        handle
            .session()?
            .shell(command)
            .output()
            .await
            .map_err(|e| TransportError::TransientIo(e.to_string()))
    }
}

impl DeviceTransport for SshTransport {
    type Handle = SshHandle;

    async fn list_devices(&self) -> Result<Vec<DeviceId>, TransportError> {
        Ok(self.devices.iter().map(DeviceConfig::device_id).collect())
    }

    async fn open_channel(&self, device: &DeviceId) -> Result<SshHandle, TransportError> {
        let config = self
            .config_for(device)
            .ok_or_else(|| TransportError::DeviceNotFound(device.to_string()))?;
        Ok(SshHandle {
            id: device.clone(),
            device: config.clone(),
            session: None,
        })
    }

    async fn handshake(&self, handle: &mut SshHandle) -> Result<(), TransportError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(handle.device.user.clone())
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(self.connect_timeout);
        if let Some(port) = handle.device.port {
            builder.port(port);
        }
        if let Some(key) = &handle.device.identity_file {
            builder.keyfile(key);
        }

        let session = builder
            .connect(&handle.device.host)
            .await
            .map_err(|e| classify_connect_error(&e.to_string()))?;
        handle.session = Some(session);

        let reply = self.raw(handle, LIVENESS).await?;
        if String::from_utf8_lossy(&reply.stdout).trim() != LIVENESS_REPLY {
            return Err(TransportError::HandshakeRejected(format!(
                "unexpected liveness reply from {}",
                handle.id
            )));
        }
        Ok(())
    }

    async fn close(&self, handle: SshHandle) {
        if let Some(session) = handle.session
            && let Err(err) = session.close().await
        {
            warn!(device = %handle.id, error = %err, "SSH session did not close cleanly");
        }
    }

    async fn read_attribute(
        &self,
        handle: &SshHandle,
        key: &str,
        _domain: Option<&str>,
    ) -> Result<Option<AttributeValue>, TransportError> {
        if key == ATTR_DEVICE_ID {
            return Ok(Some(AttributeValue::String(handle.id.to_string())));
        }
        let Some(command) = attribute_command(key) else {
            return Ok(None);
        };
        let output = self.raw(handle, command).await?;
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || value.is_empty() {
            return Ok(None);
        }
        Ok(Some(AttributeValue::String(value)))
    }

    async fn probe(&self, handle: &SshHandle, path: &str) -> Result<Option<FileMeta>, TransportError> {
        let output = self.raw(handle, &commands::stat(path)).await?;
        stat_outcome(&output)
    }

    fn has_shell(&self, _handle: &SshHandle) -> bool {
        true
    }

    async fn exec(&self, handle: &SshHandle, command: &str) -> Result<CommandOutput, TransportError> {
        Ok(command_output(&self.raw(handle, command).await?))
    }

    async fn download(&self, handle: &SshHandle, path: &str) -> Result<Vec<u8>, TransportError> {
        let output = self.raw(handle, &commands::read_file(path)).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else if missing_target(&output) {
            Err(TransportError::NotFound(path.to_string()))
        } else {
            Err(failed(&output))
        }
    }

    async fn upload(&self, handle: &SshHandle, path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let io = |e: &dyn std::fmt::Display| TransportError::TransientIo(format!("uploading {path}: {e}"));
        let session = handle.session()?;
        let mut command = session.shell(commands::write_file(path));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = command.spawn().await.map_err(|e| io(&e))?;

        if let Some(mut stdin) = child.stdin().take() {
            stdin.write_all(bytes).await.map_err(|e| io(&e))?;
            stdin.shutdown().await.map_err(|e| io(&e))?;
        }

        let output = child.wait_with_output().await.map_err(|e| io(&e))?;
        if output.status.success() {
            debug!(device = %handle.id, path, size = bytes.len(), "Uploaded");
            Ok(())
        } else if missing_target(&output) {
            Err(TransportError::NotFound(path.to_string()))
        } else {
            Err(failed(&output))
        }
    }

    async fn delete(&self, handle: &SshHandle, path: &str) -> Result<(), TransportError> {
        let output = self.raw(handle, &commands::delete_file(path)).await?;
        if output.status.success() {
            Ok(())
        } else if missing_target(&output) {
            Err(TransportError::NotFound(path.to_string()))
        } else {
            Err(failed(&output))
        }
    }

    async fn mkdir_all(&self, handle: &SshHandle, path: &str) -> Result<(), TransportError> {
        let output = self.raw(handle, &commands::mkdir_all(path)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(failed(&output))
        }
    }

    async fn chmod(
        &self,
        handle: &SshHandle,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), TransportError> {
        let output = self
            .raw(handle, &commands::chmod(path, mode, recursive))
            .await?;
        if output.status.success() {
            Ok(())
        } else if missing_target(&output) {
            Err(TransportError::NotFound(path.to_string()))
        } else {
            Err(failed(&output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_auth_failures_are_handshake_rejections() {
        assert!(matches!(
            classify_connect_error("root@10.0.0.7: Permission denied (publickey)."),
            TransportError::HandshakeRejected(_)
        ));
        assert!(matches!(
            classify_connect_error("ssh: Could not resolve hostname phone.local"),
            TransportError::DeviceNotFound(_)
        ));
        assert!(matches!(
            classify_connect_error("Connection timed out during banner exchange"),
            TransportError::TransientIo(_)
        ));
    }

    #[test]
    fn test_missing_target_detection() {
        assert!(missing_target(&output(NOT_FOUND_STATUS, "", "")));
        assert!(missing_target(&output(
            1,
            "",
            "chmod: /x: No such file or directory"
        )));
        assert!(!missing_target(&output(1, "", "Permission denied")));
    }

    #[test]
    fn test_stat_absent_only_for_missing_target() {
        let missing = output(1, "", "stat: /var/jb: stat: No such file or directory");
        assert_eq!(stat_outcome(&missing).unwrap(), None);

        let present = stat_outcome(&output(0, "Directory|96|755\n", "")).unwrap().unwrap();
        assert!(present.is_dir);

        let denied = output(1, "", "stat: /private/var/root: Permission denied");
        assert!(matches!(
            stat_outcome(&denied),
            Err(TransportError::CommandFailed { status: 1, .. })
        ));

        let io = output(1, "", "stat: /var/mobile: Input/output error");
        assert!(stat_outcome(&io).is_err());

        assert!(stat_outcome(&output(0, "garbage", "")).is_err());
    }

    #[test]
    fn test_command_output_keeps_status_and_text() {
        let out = command_output(&output(0, "dso-ready\n", ""));
        assert!(out.success());
        assert_eq!(out.stdout.trim(), LIVENESS_REPLY);
    }

    #[test]
    fn test_every_descriptor_attribute_has_a_command() {
        for key in [ATTR_VERSION, ATTR_HARDWARE, ATTR_SERIAL, ATTR_CHIP_ID] {
            assert!(attribute_command(key).is_some(), "{key}");
        }
        assert!(attribute_command("ActivationState").is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let transport = SshTransport::new(Vec::new(), Duration::from_secs(1));
        let err = transport
            .open_channel(&DeviceId::new("root@nowhere"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::DeviceNotFound(_)));
    }
}
