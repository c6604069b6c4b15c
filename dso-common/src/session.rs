//! Device session lifecycle.
//!
//! [`SessionManager`] owns the transport and at most one open [`Session`].
//! Connecting retries a bounded number of times; every failed attempt closes
//! whatever handle it opened before the next try. A successful connect emits
//! exactly one `Connected` event and the matching `disconnect` exactly one
//! `Disconnected` event.
//!
//! All device I/O made by the core goes through `Session` methods, each of
//! which is bounded by the configured command timeout. A timeout surfaces as
//! [`TransportError::TransientIo`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::commands;
use crate::errors::ErrorCode;
use crate::events::{DeviceEvent, EventBus};
use crate::retry::{RetryPolicy, RetryableError, connect_with_retry};
use crate::transport::{
    AttributeValue, ChannelKind, CommandOutput, DeviceTransport, FileMeta, TransportError,
};
use crate::types::{DeviceDescriptor, DeviceId, MutationCause};

/// Attribute keys read to build a [`DeviceDescriptor`].
pub const ATTR_DEVICE_ID: &str = "UniqueDeviceID";
pub const ATTR_VERSION: &str = "ProductVersion";
pub const ATTR_HARDWARE: &str = "ProductType";
pub const ATTR_SERIAL: &str = "SerialNumber";
pub const ATTR_CHIP_ID: &str = "UniqueChipID";

/// Errors surfaced by [`SessionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("device {device} rejected the handshake: {message}")]
    HandshakeRejected { device: DeviceId, message: String },

    #[error("transient I/O failure talking to {device}: {message}")]
    TransientIo { device: DeviceId, message: String },

    #[error("session for {device} is unusable: {message}")]
    Invalid { device: DeviceId, message: String },
}

impl SessionError {
    fn from_transport(device: &DeviceId, err: TransportError) -> Self {
        match err {
            TransportError::DeviceNotFound(_) => Self::DeviceNotFound(device.clone()),
            TransportError::HandshakeRejected(message) => Self::HandshakeRejected {
                device: device.clone(),
                message,
            },
            TransportError::TransientIo(message) => Self::TransientIo {
                device: device.clone(),
                message,
            },
            other => Self::Invalid {
                device: device.clone(),
                message: other.to_string(),
            },
        }
    }

    pub fn cause(&self) -> MutationCause {
        match self {
            Self::DeviceNotFound(_) => MutationCause::DeviceNotFound,
            Self::HandshakeRejected { .. } => MutationCause::HandshakeRejected,
            Self::TransientIo { .. } => MutationCause::TransientIoFailure,
            Self::Invalid { .. } => MutationCause::SessionInvalid,
        }
    }
}

impl RetryableError for SessionError {
    /// A device that is absent will stay absent; a device showing a trust
    /// prompt or dropping the link may accept the next attempt.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::HandshakeRejected { .. })
    }
}

/// Connection behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    /// Bound on every individual device call.
    pub command_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// An open, authenticated channel to one device.
///
/// Only [`SessionManager`] can create or close a session.
pub struct Session<T: DeviceTransport> {
    transport: Arc<T>,
    handle: T::Handle,
    descriptor: DeviceDescriptor,
    command_timeout: Duration,
}

impl<T: DeviceTransport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: DeviceTransport> Session<T> {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.descriptor.id
    }

    pub fn has_shell(&self) -> bool {
        self.transport.has_shell(&self.handle)
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn timed<R>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        match timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    device = %self.descriptor.id,
                    operation,
                    code = %ErrorCode::SessionTimeout.code_string(),
                    timeout_secs = self.command_timeout.as_secs_f64(),
                    "Device call timed out"
                );
                Err(TransportError::TransientIo(format!(
                    "{operation} timed out after {:.1}s",
                    self.command_timeout.as_secs_f64()
                )))
            }
        }
    }

    fn require_shell(&self, operation: &'static str) -> Result<(), TransportError> {
        if self.has_shell() {
            Ok(())
        } else {
            Err(TransportError::Unsupported {
                operation,
                channel: ChannelKind::Shell,
            })
        }
    }

    pub async fn read_attribute(
        &self,
        key: &str,
        domain: Option<&str>,
    ) -> Result<Option<AttributeValue>, TransportError> {
        self.timed(
            "read_attribute",
            self.transport.read_attribute(&self.handle, key, domain),
        )
        .await
    }

    /// Narrow-channel probe.
    pub async fn probe(&self, path: &str) -> Result<Option<FileMeta>, TransportError> {
        self.timed("probe", self.transport.probe(&self.handle, path))
            .await
    }

    /// Existence test over the shell channel.
    pub async fn shell_exists(&self, path: &str) -> Result<bool, TransportError> {
        let output = self.exec(&commands::exists_test(path)).await?;
        match output.status {
            0 => Ok(true),
            1 => Ok(false),
            status => Err(TransportError::CommandFailed {
                status,
                stderr: output.stderr,
            }),
        }
    }

    /// Existence check using whichever channel can answer.
    pub async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        match self.probe(path).await {
            Ok(meta) => Ok(meta.is_some()),
            Err(TransportError::Unsupported { .. }) if self.has_shell() => {
                self.shell_exists(path).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.require_shell("exec")?;
        debug!(device = %self.descriptor.id, command, "exec");
        self.timed("exec", self.transport.exec(&self.handle, command))
            .await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.require_shell("download")?;
        self.timed("download", self.transport.download(&self.handle, path))
            .await
    }

    pub async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        self.require_shell("upload")?;
        self.timed("upload", self.transport.upload(&self.handle, path, bytes))
            .await
    }

    pub async fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.require_shell("delete")?;
        self.timed("delete", self.transport.delete(&self.handle, path))
            .await
    }

    /// Create a directory tree; an existing directory is success.
    pub async fn create_dir_all(&self, path: &str) -> Result<(), TransportError> {
        self.require_shell("mkdir")?;
        self.timed("mkdir", self.transport.mkdir_all(&self.handle, path))
            .await
    }

    pub async fn set_mode(&self, path: &str, mode: u32, recursive: bool) -> Result<(), TransportError> {
        self.require_shell("chmod")?;
        self.timed(
            "chmod",
            self.transport.chmod(&self.handle, path, mode, recursive),
        )
        .await
    }

    async fn shutdown(self) {
        let Self {
            transport, handle, ..
        } = self;
        transport.close(handle).await;
    }
}

/// Owns the transport and the single live session.
pub struct SessionManager<T: DeviceTransport> {
    transport: Arc<T>,
    options: SessionOptions,
    events: Option<EventBus>,
    current: Option<Session<T>>,
}

impl<T: DeviceTransport> SessionManager<T> {
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
            events: None,
            current: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<&Session<T>> {
        self.current.as_ref()
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceId>, TransportError> {
        timeout(self.options.command_timeout, self.transport.list_devices())
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::TransientIo(
                    "device enumeration timed out".to_string(),
                ))
            })
    }

    /// Open a session, tearing down any existing one first.
    pub async fn connect(&mut self, device: &DeviceId) -> Result<&Session<T>, SessionError> {
        if self.current.is_some() {
            info!(device = %device, "Closing existing session before reconnect");
            self.disconnect().await;
        }

        let transport = Arc::clone(&self.transport);
        let command_timeout = self.options.command_timeout;
        let session = connect_with_retry(device.as_str(), &self.options.retry, |attempt| {
            let transport = Arc::clone(&transport);
            let device = device.clone();
            async move { open_once(transport, device, attempt, command_timeout).await }
        })
        .await?;

        info!(
            device = %session.descriptor.id,
            version = %session.descriptor.software_version,
            hardware = %session.descriptor.hardware_class,
            shell = session.has_shell(),
            "Session established"
        );
        if let Some(bus) = &self.events {
            bus.emit(DeviceEvent::Connected {
                descriptor: session.descriptor.clone(),
            });
        }
        Ok(self.current.insert(session))
    }

    /// Close the live session. Returns whether one was open.
    pub async fn disconnect(&mut self) -> bool {
        let Some(session) = self.current.take() else {
            return false;
        };
        let descriptor = session.descriptor.clone();
        session.shutdown().await;
        info!(device = %descriptor.id, "Session closed");
        if let Some(bus) = &self.events {
            bus.emit(DeviceEvent::Disconnected { descriptor });
        }
        true
    }
}

async fn open_once<T: DeviceTransport>(
    transport: Arc<T>,
    device: DeviceId,
    attempt: u32,
    command_timeout: Duration,
) -> Result<Session<T>, SessionError> {
    debug!(device = %device, attempt, "Opening channel");
    let mut handle = match timeout(command_timeout, transport.open_channel(&device)).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => return Err(SessionError::from_transport(&device, err)),
        Err(_) => {
            return Err(SessionError::TransientIo {
                device,
                message: "opening channel timed out".to_string(),
            });
        }
    };

    let handshake = timeout(command_timeout, transport.handshake(&mut handle)).await;
    let handshake_err = match handshake {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(SessionError::from_transport(&device, err)),
        Err(_) => Some(SessionError::TransientIo {
            device: device.clone(),
            message: "handshake timed out".to_string(),
        }),
    };
    if let Some(err) = handshake_err {
        debug!(device = %device, attempt, "Tearing down partial channel after handshake failure");
        transport.close(handle).await;
        return Err(err);
    }

    match read_descriptor(transport.as_ref(), &handle, &device, command_timeout).await {
        Ok(descriptor) => Ok(Session {
            transport,
            handle,
            descriptor,
            command_timeout,
        }),
        Err(err) => {
            transport.close(handle).await;
            Err(err)
        }
    }
}

async fn read_descriptor<T: DeviceTransport>(
    transport: &T,
    handle: &T::Handle,
    device: &DeviceId,
    command_timeout: Duration,
) -> Result<DeviceDescriptor, SessionError> {
    let read = |key: &'static str| async move {
        match timeout(command_timeout, transport.read_attribute(handle, key, None)).await {
            Ok(Ok(value)) => Ok(value.map(|v| v.as_string())),
            Ok(Err(err)) => Err(SessionError::from_transport(device, err)),
            Err(_) => Err(SessionError::TransientIo {
                device: device.clone(),
                message: format!("reading {key} timed out"),
            }),
        }
    };

    let id = read(ATTR_DEVICE_ID)
        .await?
        .map(DeviceId::new)
        .unwrap_or_else(|| device.clone());
    let version = read(ATTR_VERSION).await?.ok_or_else(|| SessionError::Invalid {
        device: device.clone(),
        message: format!("device did not report {ATTR_VERSION}"),
    })?;
    let hardware = read(ATTR_HARDWARE).await?.unwrap_or_default();
    let serial = read(ATTR_SERIAL).await?.unwrap_or_default();
    let chip_id = read(ATTR_CHIP_ID).await?.unwrap_or_default();

    DeviceDescriptor::new(id, version, hardware, serial, chip_id).map_err(|err| {
        SessionError::Invalid {
            device: device.clone(),
            message: err.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockTransport};

    fn fast_options() -> SessionOptions {
        SessionOptions {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            command_timeout: Duration::from_millis(200),
        }
    }

    fn manager_with(device: MockDevice) -> (SessionManager<MockTransport>, MockTransport) {
        let transport = MockTransport::new().with_device(device);
        (
            SessionManager::new(transport.clone(), fast_options()),
            transport,
        )
    }

    #[tokio::test]
    async fn test_connect_reads_descriptor() {
        let (mut manager, _) = manager_with(MockDevice::new("dev-a", "16.3.1"));
        let session = manager.connect(&DeviceId::new("dev-a")).await.unwrap();
        assert_eq!(session.descriptor().software_version, "16.3.1");
        assert_eq!(session.descriptor().version.major, 16);
        assert!(session.has_shell());
    }

    #[tokio::test]
    async fn test_handshake_retries_tear_down_partial_handles() {
        let device = MockDevice::new("dev-a", "16.3.1").fail_handshakes(2);
        let (mut manager, transport) = manager_with(device);

        let session = manager.connect(&DeviceId::new("dev-a")).await;
        assert!(session.is_ok());
        assert_eq!(transport.stats().opened, 3);
        assert_eq!(transport.stats().closed, 2);
    }

    #[tokio::test]
    async fn test_handshake_exhausts_attempts() {
        let device = MockDevice::new("dev-a", "16.3.1").fail_handshakes(5);
        let (mut manager, transport) = manager_with(device);

        let err = manager.connect(&DeviceId::new("dev-a")).await.err().unwrap();
        assert!(matches!(err, SessionError::HandshakeRejected { .. }));
        assert_eq!(transport.stats().opened, 3);
        assert_eq!(transport.stats().closed, 3);
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn test_missing_device_is_not_retried() {
        let (mut manager, transport) = manager_with(MockDevice::new("dev-a", "16.0"));
        let err = manager.connect(&DeviceId::new("ghost")).await.err().unwrap();
        assert_eq!(err, SessionError::DeviceNotFound(DeviceId::new("ghost")));
        assert_eq!(transport.stats().open_attempts, 1);
    }

    #[tokio::test]
    async fn test_unparsable_version_is_invalid() {
        let (mut manager, transport) = manager_with(MockDevice::new("dev-a", "unknown"));
        let err = manager.connect(&DeviceId::new("dev-a")).await.err().unwrap();
        assert!(matches!(err, SessionError::Invalid { .. }));
        assert_eq!(err.cause(), MutationCause::SessionInvalid);
        assert_eq!(transport.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_existing_session() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let (manager, transport) = manager_with(MockDevice::new("dev-a", "15.1"));
        let mut manager = manager.with_events(bus);

        manager.connect(&DeviceId::new("dev-a")).await.unwrap();
        manager.connect(&DeviceId::new("dev-a")).await.unwrap();
        assert_eq!(transport.stats().closed, 1);

        let mut kinds = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            kinds.push(match envelope.event {
                DeviceEvent::Connected { .. } => "connected",
                DeviceEvent::Disconnected { .. } => "disconnected",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["connected", "disconnected", "connected"]);
    }

    #[tokio::test]
    async fn test_failed_connect_emits_nothing() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let (manager, _) = manager_with(MockDevice::new("dev-a", "15.1").fail_handshakes(9));
        let mut manager = manager.with_events(bus);

        assert!(manager.connect(&DeviceId::new("dev-a")).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let (mut manager, transport) = manager_with(MockDevice::new("dev-a", "15.1"));
        assert!(!manager.disconnect().await);
        assert_eq!(transport.stats().closed, 0);
    }

    #[tokio::test]
    async fn test_slow_command_times_out_as_transient() {
        let device = MockDevice::new("dev-a", "16.0").with_exec_delay(Duration::from_secs(5));
        let (mut manager, _) = manager_with(device);
        let session = manager.connect(&DeviceId::new("dev-a")).await.unwrap();

        let err = session.exec("uname -a").await.unwrap_err();
        assert!(matches!(err, TransportError::TransientIo(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_shell_operations_require_shell_channel() {
        let (mut manager, _) = manager_with(MockDevice::new("dev-a", "16.0").narrow_only());
        let session = manager.connect(&DeviceId::new("dev-a")).await.unwrap();

        let err = session.write_file("/tmp/x", b"1").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unsupported {
                channel: ChannelKind::Shell,
                ..
            }
        ));
    }
}
