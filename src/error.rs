//! Error types for device-flasher
//!
//! This module provides the error taxonomy for a flashing run:
//! - User-declined gates (clean abort, never logged as an error)
//! - Validation failures (key payload sentinels, archive signatures, checksums)
//! - Transport failures reported by the device library
//! - Mode-detection timeouts and exhausted retries
//! - Stage context wrapping so the caller sees where the run stopped

use crate::types::FlashState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for device-flasher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for device-flasher
///
/// A run either completes or returns exactly one of these. Stage-level failures
/// arrive wrapped in [`Error::Stage`] so the message names the stage that failed.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "catalog.index_url")
        key: Option<String>,
    },

    /// The user declined a confirmation gate, or the gate timed out
    #[error("user declined: {action}")]
    UserDeclined {
        /// The irreversible action that was not approved
        action: String,
    },

    /// A confirmation gate is already pending
    #[error("a confirmation gate is already pending")]
    GateBusy,

    /// Input failed validation before any device command was issued
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Device transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device did not show up in the expected mode within the polling bound
    #[error("device not found in expected mode ({expected}) after {ticks} checks")]
    ModeTimeout {
        /// Description of the awaited mode
        expected: String,
        /// Number of checks performed before giving up
        ticks: u32,
    },

    /// The device answered but is in a state that forbids the operation
    #[error("{0}")]
    DeviceState(String),

    /// A bounded retry ran out of attempts
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// The error from the final attempt
        #[source]
        last: Box<Error>,
    },

    /// Writing a partition image failed (never retried)
    #[error("flashing partition {partition} failed: {source}")]
    PartitionFlash {
        /// Target partition name
        partition: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// The sideload transfer stopped before the declared size was written
    #[error("sideload interrupted at {offset}/{total} bytes: {reason}")]
    SideloadInterrupted {
        /// Bytes written before the interruption
        offset: u64,
        /// Declared total size
        total: u64,
        /// Failure description
        reason: String,
    },

    /// A stage failed; wraps the underlying cause with stage context
    #[error("{stage} stage failed: {source}")]
    Stage {
        /// Stage that was executing
        stage: FlashState,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A wait was cancelled from outside the run
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Zip archive could not be read
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Build catalog could not be read
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap this error with the stage it occurred in.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost stage wins.
    pub fn in_stage(self, stage: FlashState) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// True when the run stopped because the user declined (or ignored) a gate
    pub fn is_user_declined(&self) -> bool {
        match self {
            Error::UserDeclined { .. } => true,
            Error::Stage { source, .. } => source.is_user_declined(),
            _ => false,
        }
    }

    /// True when the user stopped the run, by a gate or by cancellation
    pub fn is_user_abort(&self) -> bool {
        match self {
            Error::UserDeclined { .. } | Error::Cancelled => true,
            Error::Stage { source, .. } => source.is_user_abort(),
            _ => false,
        }
    }

    /// The stage this error was raised in, if it carries stage context
    pub fn stage(&self) -> Option<FlashState> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Validation failures detected before touching the device
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Key payload size is outside the plausible range
    #[error("key payload is {size} bytes, expected between {min} and {max}")]
    KeySize {
        /// Actual size
        size: usize,
        /// Minimum accepted size
        min: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// Key payload starts like an HTML page or a JSON error body
    #[error("key payload looks like an error page (found {marker:?}), not a key")]
    KeyLooksLikeErrorPage {
        /// The marker that matched
        marker: String,
    },

    /// The file does not carry the zip local header signature
    #[error("{path} is not a zip archive (leading bytes {found:02x?})")]
    NotAnArchive {
        /// Archive path
        path: PathBuf,
        /// The bytes found instead of `PK`
        found: Vec<u8>,
    },

    /// Downloaded content does not match the expected SHA-256
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Artifact name
        name: String,
        /// Expected hex digest
        expected: String,
        /// Computed hex digest
        actual: String,
    },

    /// The archive holds neither an OTA payload nor partition images
    #[error("nothing to flash in {archive}: {reason}")]
    NoFlashableContent {
        /// Archive path
        archive: PathBuf,
        /// What was missing
        reason: String,
    },
}

/// Errors reported by a device transport or device provider
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The device went away (rebooted, unplugged, changed USB identity)
    #[error("device disconnected")]
    Disconnected,

    /// The device rejected a command
    #[error("command {command:?} failed: {reason}")]
    CommandFailed {
        /// Command or variable that was issued
        command: String,
        /// Failure text reported by the device
        reason: String,
    },

    /// The device did not answer in time
    #[error("transport timeout after {0}ms")]
    Timeout(u64),

    /// The transport family cannot perform the operation
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Malformed response
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True for failures that mean the device dropped off the bus
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}
