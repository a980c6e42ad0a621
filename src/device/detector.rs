//! Mode detection and reconnection
//!
//! After any command that reboots the device or changes its USB identity the
//! orchestrator asks the [`ModeDetector`] for a fresh session. The detector
//! enumerates authorized devices, filters by vendor, connects to each candidate
//! in the protocol it exposes and classifies it with a cheap read-only probe.
//! Waiting is bounded: running out of ticks is a [`Error::ModeTimeout`].

use super::commands::{VAR_ADB_STATE, VAR_IS_USERSPACE};
use super::logging::LoggingTransport;
use super::session::{DeviceSession, PendingReconnect};
use super::transport::{DeviceDescriptor, DeviceProvider, DeviceTransport};
use crate::config::DetectConfig;
use crate::error::{Error, Result, TransportError};
use crate::retry::BoundedPoll;
use crate::types::{DeviceMode, Protocol};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Which modes satisfy a wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    /// Exactly this mode
    Mode(DeviceMode),
    /// Classic bootloader or fastbootd
    BootloaderFamily,
    /// Anything the flasher can talk to
    Any,
}

impl Expect {
    /// True if `mode` satisfies this expectation
    pub fn matches(self, mode: DeviceMode) -> bool {
        match self {
            Expect::Mode(expected) => expected == mode,
            Expect::BootloaderFamily => mode.protocol() == Protocol::Bootloader,
            Expect::Any => true,
        }
    }

    fn allows(self, protocol: Protocol) -> bool {
        match self {
            Expect::Mode(mode) => mode.protocol() == protocol,
            Expect::BootloaderFamily => protocol == Protocol::Bootloader,
            Expect::Any => true,
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Mode(mode) => write!(f, "{mode}"),
            Expect::BootloaderFamily => write!(f, "bootloader or fastbootd"),
            Expect::Any => write!(f, "any mode"),
        }
    }
}

/// Finds devices and (re)establishes sessions
pub struct ModeDetector {
    provider: Arc<dyn DeviceProvider>,
    config: DetectConfig,
    cancel: CancellationToken,
}

impl ModeDetector {
    /// Create a detector over `provider`
    pub fn new(provider: Arc<dyn DeviceProvider>, config: DetectConfig) -> Self {
        Self {
            provider,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel waits from outside; takes effect between ticks
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    fn poll(&self) -> BoundedPoll {
        BoundedPoll::new(self.config.poll_interval, self.config.max_ticks)
    }

    /// Wait until a device in a mode matching `expect` answers its probe
    pub async fn wait_for(&self, expect: Expect) -> Result<DeviceSession> {
        info!(%expect, "waiting for device");
        let found = self
            .poll()
            .poll(&self.cancel, |tick| self.scan(expect, tick))
            .await?;

        match found {
            Some(session) => {
                info!(serial = %session.serial(), mode = %session.mode(), "device found");
                Ok(session)
            }
            None => Err(Error::ModeTimeout {
                expected: expect.to_string(),
                ticks: self.config.max_ticks,
            }),
        }
    }

    /// Re-establish a session after a reboot.
    ///
    /// When the device is expected back in the same protocol family, the old
    /// handle's own reconnect is tried first (bounded by the polling window).
    /// Otherwise, or if that fails, the old handle is closed before enumeration
    /// opens a new one.
    pub async fn reconnect(
        &self,
        mut pending: PendingReconnect,
        expect: Expect,
    ) -> Result<DeviceSession> {
        let protocol = pending.from().protocol();

        if expect.allows(protocol) {
            let window = self.config.poll_interval * self.config.max_ticks;
            let reattached =
                tokio::time::timeout(window, pending.transport_mut().wait_for_reconnect()).await;
            if let Ok(Ok(())) = reattached {
                match read_mode(pending.transport_mut()).await {
                    Ok(mode) if expect.matches(mode) => {
                        info!(serial = %pending.serial(), %mode, "device reattached");
                        return Ok(DeviceSession::from_reconnect(pending, mode));
                    }
                    Ok(mode) => debug!(%mode, %expect, "reattached in unexpected mode"),
                    Err(e) => debug!(error = %e, "probe after reattach failed"),
                }
            }
        }

        pending.abandon().await;
        self.wait_for(expect).await
    }

    async fn scan(&self, expect: Expect, tick: u32) -> Option<DeviceSession> {
        let devices = match self.provider.enumerate().await {
            Ok(devices) => devices,
            Err(e) => {
                debug!(tick, error = %e, "enumeration failed");
                return None;
            }
        };

        for device in devices.iter().filter(|d| d.vendor_id == self.config.vendor_id) {
            let protocol = device.protocol();
            if !expect.allows(protocol) {
                continue;
            }
            match self.probe(device, protocol).await {
                Ok(session) if expect.matches(session.mode()) => return Some(session),
                Ok(session) => {
                    debug!(
                        tick,
                        serial = %device.serial,
                        mode = %session.mode(),
                        %expect,
                        "device in other mode"
                    );
                    session.close().await;
                }
                Err(e) => debug!(tick, serial = %device.serial, error = %e, "probe failed"),
            }
        }
        None
    }

    /// Connect to `device` and classify its mode
    pub async fn probe(
        &self,
        device: &DeviceDescriptor,
        protocol: Protocol,
    ) -> Result<DeviceSession> {
        let inner = self.provider.open(device, protocol).await?;
        let mut transport: Box<dyn DeviceTransport> =
            Box::new(LoggingTransport::new(device.serial.clone(), inner));

        let mode = match transport.connect().await {
            Ok(()) => read_mode(transport.as_mut()).await,
            Err(e) => Err(e),
        };
        match mode {
            Ok(mode) => Ok(DeviceSession::new(device.serial.clone(), mode, transport)),
            Err(e) => {
                transport.close().await.ok();
                Err(e.into())
            }
        }
    }
}

/// Classify the mode of a connected transport
async fn read_mode(
    transport: &mut dyn DeviceTransport,
) -> std::result::Result<DeviceMode, TransportError> {
    match transport.protocol() {
        Protocol::Bootloader => match transport.get_variable(VAR_IS_USERSPACE).await {
            Ok(value) if value.trim().eq_ignore_ascii_case("yes") => {
                Ok(DeviceMode::FastbootUserspace)
            }
            Ok(_) => Ok(DeviceMode::Bootloader),
            // Older bootloaders do not know the variable at all
            Err(TransportError::CommandFailed { .. }) => Ok(DeviceMode::Bootloader),
            Err(e) => Err(e),
        },
        Protocol::Adb => {
            let state = transport.get_variable(VAR_ADB_STATE).await?;
            if state.trim().eq_ignore_ascii_case("sideload") {
                Ok(DeviceMode::AdbSideload)
            } else {
                Ok(DeviceMode::AdbNormal)
            }
        }
    }
}
