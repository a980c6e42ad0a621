//! Logging decorator for device transports

use super::commands::POLLING_VARS;
use super::transport::{DeviceTransport, SideloadChannel};
use crate::error::TransportError;
use crate::types::Protocol;
use async_trait::async_trait;
use tracing::{debug, trace, warn};

const MAX_LOGGED_VALUE: usize = 100;

/// Wraps a transport and logs every call before and after forwarding it.
///
/// Reads of the variables polled in tight loops are only traced.
pub struct LoggingTransport {
    serial: String,
    inner: Box<dyn DeviceTransport>,
}

impl LoggingTransport {
    /// Wrap `inner`
    pub fn new(serial: impl Into<String>, inner: Box<dyn DeviceTransport>) -> Self {
        Self {
            serial: serial.into(),
            inner,
        }
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_LOGGED_VALUE {
        value.to_string()
    } else {
        let head: String = value.chars().take(MAX_LOGGED_VALUE).collect();
        format!("{head}...")
    }
}

fn log_result<T>(serial: &str, call: &str, result: &Result<T, TransportError>) {
    match result {
        Ok(_) => debug!(serial, call, "device call ok"),
        Err(e) => warn!(serial, call, error = %e, "device call failed"),
    }
}

#[async_trait]
impl DeviceTransport for LoggingTransport {
    fn protocol(&self) -> Protocol {
        self.inner.protocol()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(serial = %self.serial, protocol = %self.inner.protocol(), "connect");
        let result = self.inner.connect().await;
        log_result(&self.serial, "connect", &result);
        result
    }

    async fn get_variable(&mut self, name: &str) -> Result<String, TransportError> {
        let quiet = POLLING_VARS.contains(&name);
        if !quiet {
            debug!(serial = %self.serial, variable = name, "get_variable");
        }
        let result = self.inner.get_variable(name).await;
        match (&result, quiet) {
            (Ok(value), true) => {
                trace!(serial = %self.serial, variable = name, value = %truncate(value), "variable")
            }
            (Ok(value), false) => {
                debug!(serial = %self.serial, variable = name, value = %truncate(value), "variable")
            }
            (Err(e), true) => {
                trace!(serial = %self.serial, variable = name, error = %e, "variable unreadable")
            }
            (Err(e), false) => {
                warn!(serial = %self.serial, variable = name, error = %e, "variable unreadable")
            }
        }
        result
    }

    async fn run_command(&mut self, command: &str) -> Result<(), TransportError> {
        debug!(serial = %self.serial, command, "run_command");
        let result = self.inner.run_command(command).await;
        log_result(&self.serial, command, &result);
        result
    }

    async fn wait_for_reconnect(&mut self) -> Result<(), TransportError> {
        debug!(serial = %self.serial, "wait_for_reconnect");
        let result = self.inner.wait_for_reconnect().await;
        log_result(&self.serial, "wait_for_reconnect", &result);
        result
    }

    async fn write_partition(
        &mut self,
        partition: &str,
        data: &[u8],
    ) -> Result<(), TransportError> {
        debug!(serial = %self.serial, partition, bytes = data.len(), "write_partition");
        let result = self.inner.write_partition(partition, data).await;
        log_result(&self.serial, partition, &result);
        result
    }

    async fn open_sideload(
        &mut self,
        total_size: u64,
    ) -> Result<Box<dyn SideloadChannel>, TransportError> {
        debug!(serial = %self.serial, total_size, "open_sideload");
        let result = self.inner.open_sideload(total_size).await;
        log_result(&self.serial, "open_sideload", &result);
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!(serial = %self.serial, "close");
        self.inner.close().await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{Call, MockDevice};

    #[test]
    fn long_values_are_truncated() {
        let long = "x".repeat(150);
        let logged = truncate(&long);
        assert_eq!(logged.len(), 103);
        assert!(logged.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn calls_are_forwarded_unchanged() {
        let device = MockDevice::bootloader("SER1");
        device.set_variable("product", "husky");
        let mut transport = LoggingTransport::new("SER1", device.transport(Protocol::Bootloader));

        transport.connect().await.unwrap();
        assert_eq!(transport.get_variable("product").await.unwrap(), "husky");
        transport.run_command("erase:avb_custom_key").await.unwrap();
        transport.write_partition("avb_custom_key", &[1, 2, 3]).await.unwrap();

        assert_eq!(
            device.calls(),
            vec![
                Call::Connect(Protocol::Bootloader),
                Call::GetVar("product".into()),
                Call::Command("erase:avb_custom_key".into()),
                Call::Write {
                    partition: "avb_custom_key".into(),
                    len: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let device = MockDevice::bootloader("SER1");
        device.fail_command("oem unlock", "unknown command");
        let mut transport = LoggingTransport::new("SER1", device.transport(Protocol::Bootloader));

        let err = transport.run_command("oem unlock").await.unwrap_err();
        assert!(matches!(err, TransportError::CommandFailed { .. }));
    }
}
