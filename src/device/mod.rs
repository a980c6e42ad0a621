//! Device access: sessions, mode detection and the transport seam
//!
//! The transport itself is external. This module owns everything between it and
//! the orchestrator:
//! - [`DeviceSession`] wraps one open transport in one known mode
//! - [`ModeDetector`] finds the device again after every reboot
//! - [`LoggingTransport`] records each device call
//! - [`StatsPoller`] feeds the UI while no run is active

pub mod adb;
pub mod commands;
mod detector;
mod logging;
pub mod mock;
mod session;
mod stats;
mod transport;

pub use detector::{Expect, ModeDetector};
pub use logging::LoggingTransport;
pub use session::{DeviceSession, PendingReconnect};
pub use stats::{SessionSlot, StatsPoller, snapshot};
pub use transport::{
    ADB_INTERFACE, ADB_PRODUCT_ID, DeviceDescriptor, DeviceProvider, DeviceTransport,
    SideloadChannel, UsbInterface,
};
