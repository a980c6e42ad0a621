//! Locking stage

use super::{Flasher, Run};
use crate::device::Expect;
use crate::device::commands::FLASHING_LOCK;
use crate::error::Result;
use crate::types::{GateDecision, LogLevel, StageOutcome};
use tracing::info;

pub(super) const LOCK_WARNING: &str = "CRITICAL WARNING: You are about to LOCK the bootloader. \
     Ensure you have flashed the correct AVB Custom Key matching your installed system. \
     If keys mismatch, your device will BRICK. Proceed?";

impl Flasher {
    pub(super) async fn lock(&self, run: &mut Run<'_>) -> Result<StageOutcome> {
        self.lock_bootloader(run).await?;
        Ok(StageOutcome::Continue)
    }

    /// Gated lock from the classic bootloader.
    ///
    /// Declining is not a failure: the device simply stays unlocked.
    pub(super) async fn lock_bootloader(&self, run: &mut Run<'_>) -> Result<()> {
        self.ensure_classic_bootloader(run).await?;

        if self.gate.ask(LOCK_WARNING).await? == GateDecision::Declined {
            self.reporter.log(
                "Locking skipped by user or timeout. Device remains unlocked.",
                LogLevel::Info,
            );
            return Ok(());
        }

        self.reporter.log("Locking bootloader...", LogLevel::Info);
        let pending = run.take_session()?.reboot(FLASHING_LOCK).await?;
        self.action_required("Confirm LOCK on the device screen.");
        run.session = Some(
            self.detector
                .reconnect(pending, Expect::BootloaderFamily)
                .await?,
        );

        info!("bootloader locked");
        self.reporter.log("Bootloader locked.", LogLevel::Success);
        Ok(())
    }
}
