//! Simulated device for tests and dry runs
//!
//! [`MockDevice`] models one phone: its current mode, lock state and variables.
//! Reboot commands move it to a new mode and invalidate every transport opened
//! before the reboot, so a command sent to a stale handle fails the way a real
//! device would. Every call is recorded for assertions.

use super::session::DeviceSession;
use super::transport::{
    ADB_INTERFACE, ADB_PRODUCT_ID, DeviceDescriptor, DeviceProvider, DeviceTransport,
    SideloadChannel, UsbInterface,
};
use crate::error::TransportError;
use crate::types::{DeviceMode, Protocol};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const FASTBOOT_PRODUCT_ID: u16 = 0x4ee0;
const FASTBOOT_INTERFACE: UsbInterface = UsbInterface {
    class: 0xff,
    subclass: 0x42,
    protocol: 0x03,
};

/// A recorded device interaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// Handshake in the given family
    Connect(Protocol),
    /// Variable read
    GetVar(String),
    /// Command
    Command(String),
    /// Partition write
    Write {
        /// Partition name
        partition: String,
        /// Payload length
        len: usize,
    },
    /// Reconnect wait on an existing handle
    WaitForReconnect,
    /// Sideload channel opened with a declared size
    SideloadOpen(u64),
    /// Sideload chunk written
    SideloadChunk(usize),
    /// Sideload channel closed
    SideloadClose,
    /// Transport closed
    Close,
}

struct State {
    serial: String,
    vendor_id: u16,
    mode: DeviceMode,
    generation: u64,
    unlocked: bool,
    variables: HashMap<String, String>,
    removed: HashSet<String>,
    calls: Vec<Call>,
    written: Vec<(String, Vec<u8>)>,
    failing_commands: HashMap<String, String>,
    disconnecting_commands: HashSet<String>,
    write_failures: HashMap<String, u32>,
    sideload_fail_at: Option<usize>,
    reboot_absence: u32,
    absent_for: u32,
    present: bool,
    enumerations: u32,
}

impl State {
    fn reboot_to(&mut self, mode: DeviceMode) {
        self.mode = mode;
        self.generation += 1;
        self.absent_for = self.reboot_absence;
    }

    fn check(&self, protocol: Protocol, generation: u64) -> Result<(), TransportError> {
        if !self.present || generation != self.generation || protocol != self.mode.protocol() {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

/// Simulated device shared between the test and the transports it hands out
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<State>>,
}

impl MockDevice {
    /// Device sitting in `mode`, locked
    pub fn new(serial: &str, mode: DeviceMode) -> Self {
        let mut variables = HashMap::new();
        variables.insert("product".to_string(), "husky".to_string());
        Self {
            state: Arc::new(Mutex::new(State {
                serial: serial.to_string(),
                vendor_id: 0x18d1,
                mode,
                generation: 0,
                unlocked: false,
                variables,
                removed: HashSet::new(),
                calls: Vec::new(),
                written: Vec::new(),
                failing_commands: HashMap::new(),
                disconnecting_commands: HashSet::new(),
                write_failures: HashMap::new(),
                sideload_fail_at: None,
                reboot_absence: 0,
                absent_for: 0,
                present: true,
                enumerations: 0,
            })),
        }
    }

    /// Locked device in the classic bootloader
    pub fn bootloader(serial: &str) -> Self {
        Self::new(serial, DeviceMode::Bootloader)
    }

    /// Set the bootloader lock state
    pub fn set_unlocked(&self, unlocked: bool) {
        self.state.lock().unlocked = unlocked;
    }

    /// Report a different USB vendor id
    pub fn set_vendor_id(&self, vendor_id: u16) {
        self.state.lock().vendor_id = vendor_id;
    }

    /// Set a variable (or ADB property / shell output)
    pub fn set_variable(&self, name: &str, value: &str) {
        let mut state = self.state.lock();
        state.removed.remove(name);
        state.variables.insert(name.to_string(), value.to_string());
    }

    /// Make a variable unreadable
    pub fn remove_variable(&self, name: &str) {
        let mut state = self.state.lock();
        state.variables.remove(name);
        state.removed.insert(name.to_string());
    }

    /// Reject `command` with `reason`
    pub fn fail_command(&self, command: &str, reason: &str) {
        self.state
            .lock()
            .failing_commands
            .insert(command.to_string(), reason.to_string());
    }

    /// Report a disconnect after executing `command`
    pub fn disconnect_on_command(&self, command: &str) {
        self.state
            .lock()
            .disconnecting_commands
            .insert(command.to_string());
    }

    /// Fail the next `times` writes to `partition`
    pub fn fail_writes(&self, partition: &str, times: u32) {
        self.state
            .lock()
            .write_failures
            .insert(partition.to_string(), times);
    }

    /// Drop the connection when the sideload chunk with this index is written
    pub fn fail_sideload_at(&self, chunk: usize) {
        self.state.lock().sideload_fail_at = Some(chunk);
    }

    /// Stay off the bus for this many enumerations after each reboot
    pub fn set_reboot_absence(&self, enumerations: u32) {
        self.state.lock().reboot_absence = enumerations;
    }

    /// Unplug or replug the device
    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    /// Current mode
    pub fn mode(&self) -> DeviceMode {
        self.state.lock().mode
    }

    /// Current lock state
    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Commands issued so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Command(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    /// Successful partition writes, in order
    pub fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().written.clone()
    }

    /// Number of enumerations that saw this device's bus
    pub fn enumerations(&self) -> u32 {
        self.state.lock().enumerations
    }

    /// Descriptor as the device currently appears on the bus
    pub fn descriptor(&self) -> DeviceDescriptor {
        let state = self.state.lock();
        let (product_id, interface) = match state.mode.protocol() {
            Protocol::Adb => (ADB_PRODUCT_ID, ADB_INTERFACE),
            Protocol::Bootloader => (FASTBOOT_PRODUCT_ID, FASTBOOT_INTERFACE),
        };
        DeviceDescriptor {
            serial: state.serial.clone(),
            vendor_id: state.vendor_id,
            product_id,
            interfaces: vec![interface],
        }
    }

    /// Unconnected transport bound to the current boot of the device
    pub fn transport(&self, protocol: Protocol) -> Box<dyn DeviceTransport> {
        let generation = self.state.lock().generation;
        Box::new(MockTransport {
            device: self.clone(),
            protocol,
            generation,
        })
    }

    /// Connected session in the device's current mode
    pub async fn session(&self, protocol: Protocol) -> DeviceSession {
        let mut transport = self.transport(protocol);
        // Connecting a mock in the right protocol cannot fail
        transport.connect().await.ok();
        let (serial, mode) = {
            let state = self.state.lock();
            (state.serial.clone(), state.mode)
        };
        DeviceSession::new(serial, mode, transport)
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

struct MockTransport {
    device: MockDevice,
    protocol: Protocol,
    generation: u64,
}

#[async_trait]
impl DeviceTransport for MockTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.device.record(Call::Connect(self.protocol));
        let state = self.device.state.lock();
        state.check(self.protocol, self.generation).map_err(|_| {
            TransportError::ConnectionFailed(format!("{} not available", self.protocol))
        })
    }

    async fn get_variable(&mut self, name: &str) -> Result<String, TransportError> {
        self.device.record(Call::GetVar(name.to_string()));
        let state = self.device.state.lock();
        state.check(self.protocol, self.generation)?;

        let not_found = || TransportError::CommandFailed {
            command: format!("getvar:{name}"),
            reason: "GetVar Variable Not found".to_string(),
        };
        if state.removed.contains(name) {
            return Err(not_found());
        }

        let dynamic = match (self.protocol, name) {
            (Protocol::Bootloader, "is-userspace") => {
                Some(if state.mode == DeviceMode::FastbootUserspace { "yes" } else { "no" })
            }
            (Protocol::Bootloader, "unlocked") => Some(if state.unlocked { "yes" } else { "no" }),
            (Protocol::Adb, "adb:state") => {
                Some(if state.mode == DeviceMode::AdbSideload { "sideload" } else { "device" })
            }
            _ => None,
        };
        match dynamic {
            Some(value) => Ok(value.to_string()),
            None => state.variables.get(name).cloned().ok_or_else(not_found),
        }
    }

    async fn run_command(&mut self, command: &str) -> Result<(), TransportError> {
        self.device.record(Call::Command(command.to_string()));
        let mut state = self.device.state.lock();
        state.check(self.protocol, self.generation)?;

        if let Some(reason) = state.failing_commands.get(command) {
            return Err(TransportError::CommandFailed {
                command: command.to_string(),
                reason: reason.clone(),
            });
        }

        match (self.protocol, command) {
            (Protocol::Bootloader, "reboot-bootloader") => state.reboot_to(DeviceMode::Bootloader),
            (Protocol::Bootloader, "reboot-fastboot") => {
                state.reboot_to(DeviceMode::FastbootUserspace)
            }
            (Protocol::Bootloader, "reboot-recovery") => state.reboot_to(DeviceMode::AdbSideload),
            (Protocol::Bootloader, "reboot") => state.reboot_to(DeviceMode::AdbNormal),
            (Protocol::Bootloader, "flashing unlock" | "oem unlock") => {
                state.unlocked = true;
                state.reboot_to(DeviceMode::Bootloader);
            }
            (Protocol::Bootloader, "flashing lock") => {
                state.unlocked = false;
                state.reboot_to(DeviceMode::Bootloader);
            }
            (Protocol::Adb, "reboot:bootloader") => state.reboot_to(DeviceMode::Bootloader),
            (Protocol::Adb, "reboot:" | "reboot") => state.reboot_to(DeviceMode::AdbNormal),
            _ => {}
        }

        if state.disconnecting_commands.contains(command) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn wait_for_reconnect(&mut self) -> Result<(), TransportError> {
        self.device.record(Call::WaitForReconnect);
        let mut state = self.device.state.lock();
        if !state.present || state.mode.protocol() != self.protocol {
            return Err(TransportError::Disconnected);
        }
        state.absent_for = 0;
        self.generation = state.generation;
        Ok(())
    }

    async fn write_partition(
        &mut self,
        partition: &str,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.device.record(Call::Write {
            partition: partition.to_string(),
            len: data.len(),
        });
        let mut state = self.device.state.lock();
        state.check(self.protocol, self.generation)?;

        if let Some(left) = state.write_failures.get_mut(partition) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::CommandFailed {
                    command: format!("flash:{partition}"),
                    reason: "FAILWrite failed".to_string(),
                });
            }
        }
        state.written.push((partition.to_string(), data.to_vec()));
        Ok(())
    }

    async fn open_sideload(
        &mut self,
        total_size: u64,
    ) -> Result<Box<dyn SideloadChannel>, TransportError> {
        self.device.record(Call::SideloadOpen(total_size));
        let state = self.device.state.lock();
        state.check(self.protocol, self.generation)?;
        if state.mode != DeviceMode::AdbSideload {
            return Err(TransportError::CommandFailed {
                command: format!("sideload:{total_size}"),
                reason: "device not in sideload mode".to_string(),
            });
        }
        Ok(Box::new(MockSideload {
            device: self.device.clone(),
            fail_at: state.sideload_fail_at,
            chunks: 0,
            failed: false,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.device.record(Call::Close);
        Ok(())
    }
}

struct MockSideload {
    device: MockDevice,
    fail_at: Option<usize>,
    chunks: usize,
    failed: bool,
}

#[async_trait]
impl SideloadChannel for MockSideload {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        self.device.record(Call::SideloadChunk(chunk.len()));
        let index = self.chunks;
        self.chunks += 1;
        if self.fail_at == Some(index) {
            self.failed = true;
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.device.record(Call::SideloadClose);
        if !self.failed {
            // Installs, then the user picks "Reboot system now"
            self.device.state.lock().reboot_to(DeviceMode::AdbNormal);
        }
        Ok(())
    }
}

/// Provider over a fixed set of simulated devices
#[derive(Clone, Default)]
pub struct MockProvider {
    devices: Vec<MockDevice>,
}

impl MockProvider {
    /// Provider exposing `devices`
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceProvider for MockProvider {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut found = Vec::new();
        for device in &self.devices {
            {
                let mut state = device.state.lock();
                state.enumerations += 1;
                if !state.present {
                    continue;
                }
                if state.absent_for > 0 {
                    state.absent_for -= 1;
                    continue;
                }
            }
            found.push(device.descriptor());
        }
        Ok(found)
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        protocol: Protocol,
    ) -> Result<Box<dyn DeviceTransport>, TransportError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.state.lock().serial == descriptor.serial)
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{} is gone", descriptor.serial))
            })?;
        Ok(device.transport(protocol))
    }
}
