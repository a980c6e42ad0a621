//! Capability interfaces implemented by the device library
//!
//! The flasher does not speak USB, fastboot or ADB itself. An embedding
//! application provides a [`DeviceProvider`] that enumerates devices and opens a
//! [`DeviceTransport`] in either protocol family.

use crate::error::TransportError;
use crate::types::Protocol;
use async_trait::async_trait;

/// USB interface triple
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbInterface {
    /// Interface class
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
}

/// ADB interface class/subclass/protocol
pub const ADB_INTERFACE: UsbInterface = UsbInterface {
    class: 0xff,
    subclass: 0x42,
    protocol: 0x01,
};

/// Product id the reference devices report while running ADB
pub const ADB_PRODUCT_ID: u16 = 0x4ee7;

/// An authorized device as seen on the bus
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Serial number
    pub serial: String,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Interfaces exposed by the active configuration
    pub interfaces: Vec<UsbInterface>,
}

impl DeviceDescriptor {
    /// Protocol family the device is currently exposing
    pub fn protocol(&self) -> Protocol {
        if self.product_id == ADB_PRODUCT_ID || self.interfaces.contains(&ADB_INTERFACE) {
            Protocol::Adb
        } else {
            Protocol::Bootloader
        }
    }
}

/// Command/response access to one connected device.
///
/// Bootloader family: `get_variable` is `getvar`, `run_command` sends a raw
/// command such as `reboot-bootloader` or `erase:avb_custom_key`.
///
/// ADB family: `get_variable` reads a system property, runs a `shell:` command and
/// returns its output, or answers the reserved name `adb:state` with the
/// connection state from the device banner (`device`, `recovery`, `sideload`).
/// `run_command` opens a service such as `reboot:bootloader`.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Protocol family of this transport
    fn protocol(&self) -> Protocol;

    /// Perform the protocol handshake
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read a variable
    async fn get_variable(&mut self, name: &str) -> Result<String, TransportError>;

    /// Run a command that produces no payload
    async fn run_command(&mut self, command: &str) -> Result<(), TransportError>;

    /// Wait for the same physical device to come back after a reboot in the same family
    async fn wait_for_reconnect(&mut self) -> Result<(), TransportError>;

    /// Download `data` and flash it to `partition`
    async fn write_partition(&mut self, partition: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Open a sideload channel declaring `total_size` up front
    async fn open_sideload(
        &mut self,
        total_size: u64,
    ) -> Result<Box<dyn SideloadChannel>, TransportError> {
        let _ = total_size;
        Err(TransportError::Unsupported(format!(
            "sideload over {}",
            self.protocol()
        )))
    }

    /// Release the underlying handle
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Declared-length bulk upload channel
#[async_trait]
pub trait SideloadChannel: Send {
    /// Write one chunk
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Enumerates authorized devices and opens transports to them
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Devices currently on the bus
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a transport of the given family to `device`
    async fn open(
        &self,
        device: &DeviceDescriptor,
        protocol: Protocol,
    ) -> Result<Box<dyn DeviceTransport>, TransportError>;
}
