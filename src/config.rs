//! Configuration types for device-flasher

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a flasher instance
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Confirmation gate timing
    #[serde(default)]
    pub gate: GateConfig,

    /// Device detection and reconnection
    #[serde(default)]
    pub detect: DetectConfig,

    /// Custom key provisioning
    #[serde(default)]
    pub key: KeyConfig,

    /// Artifact cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sideload transfer
    #[serde(default)]
    pub sideload: SideloadConfig,

    /// Stats polling
    #[serde(default)]
    pub stats: StatsConfig,

    /// Build catalog location
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Network retry for downloads and catalog fetches
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Confirmation gate timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateConfig {
    /// Countdown before the confirm action is enabled (default: 60 seconds)
    #[serde(default = "default_gate_window", with = "duration_serde")]
    pub window: Duration,

    /// How long past zero the gate waits before declining on its own (default: 5 minutes)
    #[serde(default = "default_gate_grace", with = "duration_serde")]
    pub grace: Duration,

    /// Upper bound for countdown-free acknowledgements (default: 15 minutes)
    #[serde(default = "default_acknowledge_timeout", with = "duration_serde")]
    pub acknowledge_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window: default_gate_window(),
            grace: default_gate_grace(),
            acknowledge_timeout: default_acknowledge_timeout(),
        }
    }
}

/// Device detection and reconnection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectConfig {
    /// USB vendor id of supported devices (default: 0x18d1)
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    /// Delay between presence checks (default: 500ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Number of presence checks before giving up (default: 180)
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            poll_interval: default_poll_interval(),
            max_ticks: default_max_ticks(),
        }
    }
}

/// Custom key provisioning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Smallest plausible key payload in bytes (default: 64)
    #[serde(default = "default_key_min_size")]
    pub min_size: usize,

    /// Largest plausible key payload in bytes (default: 10240)
    #[serde(default = "default_key_max_size")]
    pub max_size: usize,

    /// How many leading bytes are checked for error-page markers (default: 50)
    #[serde(default = "default_sniff_len")]
    pub sniff_len: usize,

    /// Pause between erasing and writing the key slot (default: 12 seconds)
    #[serde(default = "default_settle_delay", with = "duration_serde")]
    pub settle_delay: Duration,

    /// Attempts for the key write (default: 2)
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Delay between key write attempts (default: 1 second)
    #[serde(default = "default_write_backoff", with = "duration_serde")]
    pub write_backoff: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            min_size: default_key_min_size(),
            max_size: default_key_max_size(),
            sniff_len: default_sniff_len(),
            settle_delay: default_settle_delay(),
            write_attempts: default_write_attempts(),
            write_backoff: default_write_backoff(),
        }
    }
}

/// Artifact cache
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding cached bundles (default: "./cache")
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Size difference in bytes still treated as the same artifact (default: 1024)
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: u64,

    /// Verify SHA-256 when the source publishes one (default: true)
    #[serde(default = "default_true")]
    pub verify_checksum: bool,

    /// Refuse downloads that would not fit on disk (default: true)
    #[serde(default = "default_true")]
    pub check_disk_space: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            size_tolerance: default_size_tolerance(),
            verify_checksum: true,
            check_disk_space: true,
        }
    }
}

/// Sideload transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SideloadConfig {
    /// Bytes per write (default: 65536)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SideloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Stats polling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Delay between snapshots (default: 500ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}

/// Build catalog location
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// URL of `builds_index.json`
    #[serde(default)]
    pub index_url: String,

    /// URL of the public key blob
    #[serde(default)]
    pub public_key_url: String,

    /// Development mode: read the index, key and bundles from this directory
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

/// Retry configuration for transient network failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

fn default_gate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_gate_grace() -> Duration {
    Duration::from_secs(300)
}

fn default_acknowledge_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_vendor_id() -> u16 {
    0x18d1
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_ticks() -> u32 {
    180
}

fn default_key_min_size() -> usize {
    64
}

fn default_key_max_size() -> usize {
    10240
}

fn default_sniff_len() -> usize {
    50
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(12)
}

fn default_write_attempts() -> u32 {
    2
}

fn default_write_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_size_tolerance() -> u64 {
    1024
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for polling intervals)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
