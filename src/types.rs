//! Core types for device-flasher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Protocol family spoken by a connected device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Bootloader command protocol (classic bootloader or fastbootd)
    Bootloader,
    /// OS-shell protocol (ADB)
    Adb,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Bootloader => write!(f, "fastboot"),
            Protocol::Adb => write!(f, "adb"),
        }
    }
}

/// Mode a connected device is running in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Classic bootloader
    Bootloader,
    /// Userspace bootloader ("fastbootd")
    FastbootUserspace,
    /// Booted OS with ADB
    AdbNormal,
    /// Recovery waiting for an ADB sideload
    AdbSideload,
}

impl DeviceMode {
    /// Protocol family this mode speaks
    pub fn protocol(self) -> Protocol {
        match self {
            DeviceMode::Bootloader | DeviceMode::FastbootUserspace => Protocol::Bootloader,
            DeviceMode::AdbNormal | DeviceMode::AdbSideload => Protocol::Adb,
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceMode::Bootloader => "bootloader",
            DeviceMode::FastbootUserspace => "fastbootd",
            DeviceMode::AdbNormal => "adb",
            DeviceMode::AdbSideload => "adb sideload",
        };
        f.write_str(name)
    }
}

/// What a run should do; fixed for the whole run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashPlan {
    /// Unlock the bootloader first
    pub unlock: bool,
    /// Provision the custom AVB key
    pub flash_key: bool,
    /// Flash the image bundle
    pub flash_zip: bool,
    /// Re-lock the bootloader at the end
    pub lock: bool,
    /// Erase user data after imaging
    pub wipe_data: bool,
    /// Reboot the device when the run completes
    pub auto_reboot: bool,
}

/// Where the image bundle comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Remote bundle, cached locally by name
    Url {
        /// Download URL
        url: String,
        /// Expected SHA-256 (lowercase hex), when the catalog publishes one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    /// A file already on disk (never deleted by the cache)
    Local {
        /// Path to the bundle
        path: PathBuf,
    },
}

/// Artifacts resolved before the run starts
#[derive(Clone, Debug, Default)]
pub struct ResolvedArtifacts {
    /// Custom AVB key payload
    pub key: Option<Vec<u8>>,
    /// Image bundle source
    pub image: Option<ImageSource>,
}

/// One entry of an image bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path inside its archive
    pub path: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Entry is the nested `image-*.zip`
    pub is_nested_archive: bool,
    /// Entry ends in `.img`
    pub is_partition_image: bool,
    /// Entry is named `payload.bin`
    pub is_ota_payload: bool,
    /// Entry lives inside the nested archive rather than the bundle itself
    pub in_nested: bool,
}

impl ArchiveEntry {
    /// File name without leading directories
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Progress of a long-running item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage reporting progress (e.g. "download", "imaging", "sideload")
    pub stage: String,
    /// Item within the stage (artifact or partition name)
    pub item: String,
    /// Completion between 0.0 and 1.0
    pub fraction: f64,
}

impl ProgressEvent {
    /// Build a progress event from byte counters
    pub fn from_bytes(stage: &str, item: &str, done: u64, total: u64) -> Self {
        let fraction = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).clamp(0.0, 1.0)
        };
        Self {
            stage: stage.to_string(),
            item: item.to_string(),
            fraction,
        }
    }
}

/// States of the flash orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashState {
    /// Nothing started yet
    Idle,
    /// Acquiring a device session
    Connecting,
    /// Unlocking the bootloader
    Unlocking,
    /// Writing the custom AVB key
    KeyProvisioning,
    /// Flashing images or sideloading an OTA
    Imaging,
    /// Re-locking the bootloader
    Locking,
    /// Run completed
    Done,
    /// Run stopped on an error or a declined gate
    Aborted,
}

impl FlashState {
    /// True for `Done` and `Aborted`
    pub fn is_terminal(self) -> bool {
        matches!(self, FlashState::Done | FlashState::Aborted)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashState::Idle => "idle",
            FlashState::Connecting => "connecting",
            FlashState::Unlocking => "unlocking",
            FlashState::KeyProvisioning => "key-provisioning",
            FlashState::Imaging => "imaging",
            FlashState::Locking => "locking",
            FlashState::Done => "done",
            FlashState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What a stage tells the state machine when it finishes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Move to the next state in order
    Continue,
    /// The stage already handled locking; go straight to `Done`
    SkipLocking,
}

/// Result of a confirmation gate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// User confirmed after the countdown
    Confirmed,
    /// User declined, or nobody answered before the ceiling
    Declined,
}

/// Result of a sideload transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SideloadOutcome {
    /// The full declared size was written
    Completed,
    /// A write failed or the source ran dry
    Interrupted {
        /// Bytes written before the failure
        offset: u64,
        /// Failure description
        reason: String,
    },
}

/// Bootloader lock state as reported by the `unlocked` variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockState {
    /// `unlocked: yes`
    Yes,
    /// `unlocked: no`
    No,
    /// Variable missing or unreadable
    Unknown,
}

impl UnlockState {
    /// Parse the raw variable value
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" => UnlockState::Yes,
            "no" => UnlockState::No,
            _ => UnlockState::Unknown,
        }
    }
}

/// Periodic device snapshot for display
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Device is in fastbootd
    pub is_userspace: bool,
    /// Bootloader lock state
    pub unlocked: UnlockState,
}

/// Basic information read from a device in ADB mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `ro.product.model`
    pub model: Option<String>,
    /// `ro.build.version.release`
    pub android_version: Option<String>,
    /// Battery level in percent
    pub battery_level: Option<u8>,
}

/// Severity of a user-facing log line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Routine progress
    Info,
    /// A step finished successfully
    Success,
    /// Something the user should notice
    Warning,
    /// A failure
    Error,
}

/// Event emitted during a flashing run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Orchestrator entered a new state
    StateChanged {
        /// Previous state
        from: FlashState,
        /// New state
        to: FlashState,
    },

    /// User-facing log line
    Log {
        /// Message text
        message: String,
        /// Severity
        level: LogLevel,
        /// When the line was produced
        at: DateTime<Utc>,
    },

    /// Progress update
    Progress(ProgressEvent),

    /// A confirmation gate opened
    GatePending {
        /// Warning shown to the user
        message: String,
        /// Countdown length in seconds
        window_secs: u64,
    },

    /// Countdown tick; negative once the confirm action is enabled
    GateTick {
        /// Seconds left on the countdown
        remaining_secs: i64,
    },

    /// A confirmation gate resolved
    GateClosed {
        /// Outcome
        decision: GateDecision,
    },

    /// The user must do something on the device
    ActionRequired {
        /// Instruction text
        message: String,
    },

    /// Periodic device snapshot
    Stats(DeviceStats),

    /// Run finished
    RunFinished {
        /// Terminal state
        state: FlashState,
        /// Error message when aborted
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction_is_clamped_and_total_zero_is_complete() {
        assert_eq!(ProgressEvent::from_bytes("x", "y", 5, 0).fraction, 1.0);
        assert_eq!(ProgressEvent::from_bytes("x", "y", 10, 5).fraction, 1.0);
        assert_eq!(ProgressEvent::from_bytes("x", "y", 1, 4).fraction, 0.25);
    }

    #[test]
    fn unlock_state_parses_device_replies() {
        assert_eq!(UnlockState::parse(" YES\n"), UnlockState::Yes);
        assert_eq!(UnlockState::parse("no"), UnlockState::No);
        assert_eq!(UnlockState::parse(""), UnlockState::Unknown);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::GateTick { remaining_secs: -3 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "gate_tick");
        assert_eq!(json["remaining_secs"], -3);
    }

    #[test]
    fn plan_deserializes_missing_fields_as_false() {
        let plan: FlashPlan = serde_json::from_str(r#"{"flash_key": true}"#).unwrap();
        assert!(plan.flash_key);
        assert!(!plan.unlock && !plan.lock && !plan.flash_zip);
    }
}
