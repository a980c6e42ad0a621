//! Device sessions
//!
//! A [`DeviceSession`] owns the transport to one device in one mode. Issuing a
//! reboot consumes the session and hands back a [`PendingReconnect`], which can
//! only be turned into a new session by the mode detector. Commands against a
//! device that has rebooted therefore cannot be expressed.

use super::commands;
use super::transport::{DeviceTransport, SideloadChannel};
use crate::error::{Result, TransportError};
use crate::types::{DeviceMode, UnlockState};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Connected device in a known mode
pub struct DeviceSession {
    serial: String,
    mode: DeviceMode,
    transport: Box<dyn DeviceTransport>,
    variables: HashMap<String, String>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.serial)
            .field("mode", &self.mode)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Wrap an already connected transport
    pub fn new(
        serial: impl Into<String>,
        mode: DeviceMode,
        transport: Box<dyn DeviceTransport>,
    ) -> Self {
        Self {
            serial: serial.into(),
            mode,
            transport,
            variables: HashMap::new(),
        }
    }

    /// Device serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Mode the device was in when the session was created
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Last value read for `name`, if any
    pub fn cached_variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Read a variable from the device and remember it
    pub async fn get_variable(&mut self, name: &str) -> Result<String> {
        let value = self.transport.get_variable(name).await?;
        let value = value.trim().to_string();
        self.variables.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Read a variable, treating failure as absent
    pub async fn try_variable(&mut self, name: &str) -> Option<String> {
        match self.get_variable(name).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(serial = %self.serial, variable = name, error = %e, "variable unreadable");
                None
            }
        }
    }

    /// Bootloader lock state; unreadable counts as unknown
    pub async fn unlock_state(&mut self) -> UnlockState {
        self.try_variable(commands::VAR_UNLOCKED)
            .await
            .map(|v| UnlockState::parse(&v))
            .unwrap_or(UnlockState::Unknown)
    }

    /// Run a command that does not change device identity
    pub async fn run_command(&mut self, command: &str) -> Result<()> {
        self.transport.run_command(command).await?;
        Ok(())
    }

    /// Flash `data` to `partition`
    ///
    /// Returns the raw transport error so callers can decide between retrying and
    /// reporting a partition failure.
    pub async fn write_partition(
        &mut self,
        partition: &str,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        self.transport.write_partition(partition, data).await
    }

    /// Open a sideload channel for `total_size` bytes
    pub async fn open_sideload(&mut self, total_size: u64) -> Result<Box<dyn SideloadChannel>> {
        Ok(self.transport.open_sideload(total_size).await?)
    }

    /// Issue a command that makes the device reboot or change USB identity.
    ///
    /// A disconnect while the command is in flight is expected and not an error.
    pub async fn reboot(mut self, command: &str) -> Result<PendingReconnect> {
        debug!(serial = %self.serial, mode = %self.mode, command, "issuing reboot");
        match self.transport.run_command(command).await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!(serial = %self.serial, command, "device dropped during reboot command");
            }
            Err(e) => {
                self.close().await;
                return Err(e.into());
            }
        }
        Ok(self.rebooting())
    }

    /// Give up the session after a command that the device answers by rebooting
    pub fn rebooting(self) -> PendingReconnect {
        PendingReconnect {
            serial: self.serial,
            from: self.mode,
            transport: self.transport,
        }
    }

    /// Close the transport. Failures are logged; the session is gone either way.
    pub async fn close(mut self) {
        if let Err(e) = self.transport.close().await {
            warn!(serial = %self.serial, error = %e, "failed to close device transport");
        }
    }

    pub(crate) fn from_reconnect(pending: PendingReconnect, mode: DeviceMode) -> Self {
        Self::new(pending.serial, mode, pending.transport)
    }
}

/// A device that was told to reboot and has not been found again yet
pub struct PendingReconnect {
    serial: String,
    from: DeviceMode,
    transport: Box<dyn DeviceTransport>,
}

impl PendingReconnect {
    /// Serial of the rebooting device
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Mode the device was in before the reboot
    pub fn from(&self) -> DeviceMode {
        self.from
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn DeviceTransport {
        self.transport.as_mut()
    }

    /// Release the old handle without reconnecting
    pub async fn abandon(mut self) {
        if let Err(e) = self.transport.close().await {
            debug!(serial = %self.serial, error = %e, "closing stale transport failed");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{Call, MockDevice};
    use crate::types::Protocol;

    #[tokio::test]
    async fn variables_are_trimmed_and_cached() {
        let device = MockDevice::bootloader("SER1");
        device.set_variable("product", "  husky\n");
        let mut session = device.session(Protocol::Bootloader).await;

        assert_eq!(session.get_variable("product").await.unwrap(), "husky");
        assert_eq!(session.cached_variable("product"), Some("husky"));
        assert_eq!(session.cached_variable("unlocked"), None);
    }

    #[tokio::test]
    async fn unreadable_lock_state_is_unknown() {
        let device = MockDevice::bootloader("SER1");
        device.remove_variable("unlocked");
        let mut session = device.session(Protocol::Bootloader).await;

        assert_eq!(session.unlock_state().await, UnlockState::Unknown);
    }

    #[tokio::test]
    async fn reboot_tolerates_disconnect() {
        let device = MockDevice::bootloader("SER1");
        device.disconnect_on_command("reboot-bootloader");
        let session = device.session(Protocol::Bootloader).await;

        let pending = session.reboot("reboot-bootloader").await.unwrap();
        assert_eq!(pending.from(), DeviceMode::Bootloader);
        assert_eq!(pending.serial(), "SER1");
    }

    #[tokio::test]
    async fn failed_reboot_closes_transport() {
        let device = MockDevice::bootloader("SER1");
        device.fail_command("reboot-recovery", "unknown command");
        let session = device.session(Protocol::Bootloader).await;

        assert!(session.reboot("reboot-recovery").await.is_err());
        assert_eq!(device.calls().last(), Some(&Call::Close));
    }
}
