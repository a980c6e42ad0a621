//! Custom AVB key provisioning

use super::{Flasher, Run};
use crate::config::KeyConfig;
use crate::device::Expect;
use crate::device::commands::{
    AVB_CUSTOM_KEY, ERASE_AVB_CUSTOM_KEY, REBOOT_BOOTLOADER, VAR_IS_USERSPACE,
};
use crate::error::{Error, Result, ValidationError};
use crate::retry::BoundedPoll;
use crate::types::{DeviceMode, LogLevel, StageOutcome, UnlockState};
use tracing::{debug, info};

/// Leading text of payloads that are really an error page from a web server
const ERROR_PAGE_MARKERS: [&str; 3] = ["<!DOCTYPE", "<html", "{\"error\""];

/// Reject key payloads that cannot be an AVB public key.
///
/// Runs before any device command; a payload that fails here never reaches the
/// key slot.
pub fn validate_key(key: &[u8], config: &KeyConfig) -> Result<()> {
    if key.len() < config.min_size || key.len() > config.max_size {
        return Err(ValidationError::KeySize {
            size: key.len(),
            min: config.min_size,
            max: config.max_size,
        }
        .into());
    }

    let head = &key[..key.len().min(config.sniff_len)];
    let head = String::from_utf8_lossy(head);
    if let Some(marker) = ERROR_PAGE_MARKERS.iter().find(|m| head.contains(*m)) {
        return Err(ValidationError::KeyLooksLikeErrorPage {
            marker: marker.to_string(),
        }
        .into());
    }

    Ok(())
}

impl Flasher {
    pub(super) async fn provision_key(&self, run: &mut Run<'_>) -> Result<StageOutcome> {
        let artifacts = run.artifacts;
        let Some(key) = artifacts.key.as_deref() else {
            self.reporter.log(
                "No custom key available for this build, skipping key flash.",
                LogLevel::Warning,
            );
            return Ok(StageOutcome::Continue);
        };

        validate_key(key, &self.config.key)?;
        debug!(size = key.len(), "key payload accepted");

        self.ensure_classic_bootloader(run).await?;

        let session = run.session()?;
        if session.unlock_state().await == UnlockState::No {
            return Err(Error::DeviceState(
                "device is locked: unlock the bootloader before flashing a custom key".to_string(),
            ));
        }

        self.reporter.log("Erasing previous custom key...", LogLevel::Info);
        session.run_command(ERASE_AVB_CUSTOM_KEY).await?;
        tokio::time::sleep(self.config.key.settle_delay).await;

        self.reporter.log("Flashing custom AVB key...", LogLevel::Info);
        let writer = BoundedPoll::new(
            self.config.key.write_backoff,
            self.config.key.write_attempts,
        );
        writer
            .retry("flash avb_custom_key", session, |s| {
                let key = key.to_vec();
                Box::pin(async move {
                    s.write_partition(AVB_CUSTOM_KEY, &key)
                        .await
                        .map_err(Error::from)
                })
            })
            .await?;

        info!(size = key.len(), "custom key written");
        self.reporter.log("Custom key flashed.", LogLevel::Success);
        Ok(StageOutcome::Continue)
    }

    /// Make sure the session talks to the classic bootloader, not fastbootd.
    ///
    /// The key slot and lock commands are only honoured there.
    pub(super) async fn ensure_classic_bootloader(&self, run: &mut Run<'_>) -> Result<()> {
        if run.session()?.mode() != DeviceMode::FastbootUserspace {
            return Ok(());
        }

        self.reporter.log(
            "Device is in fastbootd, switching to the bootloader...",
            LogLevel::Info,
        );
        self.reboot_and_reconnect(run, REBOOT_BOOTLOADER, Expect::BootloaderFamily)
            .await?;

        let still_userspace = run
            .session()?
            .try_variable(VAR_IS_USERSPACE)
            .await
            .is_some_and(|v| v.eq_ignore_ascii_case("yes"));
        if still_userspace {
            return Err(Error::DeviceState(
                "failed to switch to the bootloader; reboot to the bootloader manually".to_string(),
            ));
        }
        Ok(())
    }
}
