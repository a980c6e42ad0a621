//! Unlocking stage

use super::{Flasher, Run};
use crate::device::Expect;
use crate::device::commands::{FLASHING_UNLOCK, OEM_UNLOCK};
use crate::error::{Error, Result};
use crate::types::{GateDecision, LogLevel, StageOutcome, UnlockState};
use tracing::warn;

pub(super) const UNLOCK_WARNING: &str = "WARNING: You are about to UNLOCK the bootloader. \
     This will WIPE ALL DATA on the device. You have 60 seconds to confirm.";

impl Flasher {
    pub(super) async fn unlock(&self, run: &mut Run<'_>) -> Result<StageOutcome> {
        self.reporter.log("Checking bootloader state...", LogLevel::Info);
        match run.session()?.unlock_state().await {
            UnlockState::Yes => {
                self.reporter.log(
                    "Device is already unlocked. Skipping unlock step.",
                    LogLevel::Success,
                );
                return Ok(StageOutcome::Continue);
            }
            UnlockState::Unknown => self.reporter.log(
                "Could not check unlock state, assuming locked.",
                LogLevel::Warning,
            ),
            UnlockState::No => {}
        }

        if self.gate.ask(UNLOCK_WARNING).await? == GateDecision::Declined {
            return Err(Error::UserDeclined {
                action: "unlock bootloader".to_string(),
            });
        }

        self.reporter.log("Sending unlock command...", LogLevel::Info);
        let mut session = run.take_session()?;
        let sent = session.run_command(FLASHING_UNLOCK).await;
        let pending = match sent {
            Ok(()) => session.rebooting(),
            Err(Error::Transport(e)) if e.is_disconnect() => session.rebooting(),
            Err(e) => {
                warn!(error = %e, "unlock command rejected, trying alternate spelling");
                session.reboot(OEM_UNLOCK).await?
            }
        };

        self.action_required(
            "Check your phone! Use the volume keys to select UNLOCK and power to confirm.",
        );
        self.reporter.log(
            "Waiting for device to reconnect after unlock/wipe...",
            LogLevel::Info,
        );
        run.session = Some(
            self.detector
                .reconnect(pending, Expect::BootloaderFamily)
                .await?,
        );
        self.reporter.log("Bootloader unlocked.", LogLevel::Success);
        Ok(StageOutcome::Continue)
    }
}
