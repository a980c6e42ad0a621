//! OTA install over sideload
//!
//! The device is sent to recovery, the user picks "Apply update from ADB",
//! and the whole bundle is streamed over the sideload channel. The device then
//! boots the new system. Locking afterwards needs a round trip through Android
//! back into the bootloader, and only happens once the user has confirmed that
//! the new system booted.

use super::{Flasher, Run};
use crate::cache::CachedArtifact;
use crate::device::commands::REBOOT_RECOVERY;
use crate::device::{Expect, adb};
use crate::error::{Error, Result};
use crate::sideload::SideloadTransfer;
use crate::types::{DeviceMode, GateDecision, LogLevel, SideloadOutcome};
use tracing::info;

pub(super) const BOOT_CHECK: &str = "Did the device boot into the new system? \
     Confirm once the lock screen is visible; the bootloader is locked next.";

impl Flasher {
    pub(super) async fn sideload_flow(
        &self,
        run: &mut Run<'_>,
        bundle: &CachedArtifact,
    ) -> Result<()> {
        self.reporter.log("Rebooting to recovery...", LogLevel::Info);
        let pending = run.take_session()?.reboot(REBOOT_RECOVERY).await?;
        self.action_required(
            "On the device, choose \"Apply update from ADB\" in the recovery menu.",
        );
        let session = run.session.insert(
            self.detector
                .reconnect(pending, Expect::Mode(DeviceMode::AdbSideload))
                .await?,
        );

        let mut file = tokio::fs::File::open(&bundle.path).await?;
        let total = file.metadata().await?.len();
        self.reporter.log(
            &format!("Sideloading {} ({} bytes)...", bundle.name, total),
            LogLevel::Info,
        );

        let transfer =
            SideloadTransfer::new(self.config.sideload.chunk_size, self.reporter.clone());
        match transfer.transfer(session, &mut file, total, &bundle.name).await? {
            SideloadOutcome::Completed => {}
            SideloadOutcome::Interrupted { offset, reason } => {
                return Err(Error::SideloadInterrupted { offset, total, reason });
            }
        }

        info!(name = %bundle.name, total, "OTA transferred");
        self.reporter.log("Update transferred.", LogLevel::Success);
        self.action_required("When the install finishes, choose \"Reboot system now\".");

        if !run.plan.lock {
            run.take_session()?.rebooting().abandon().await;
            return Ok(());
        }

        if self.gate.acknowledge(BOOT_CHECK).await? == GateDecision::Declined {
            self.reporter.log(
                "Boot not confirmed, skipping bootloader lock. Device remains unlocked.",
                LogLevel::Warning,
            );
            run.take_session()?.rebooting().abandon().await;
            return Ok(());
        }

        let pending = run.take_session()?.rebooting();
        let android = self
            .detector
            .reconnect(pending, Expect::Mode(DeviceMode::AdbNormal))
            .await?;
        self.reporter.log("Rebooting to bootloader for locking...", LogLevel::Info);
        let pending = adb::reboot_to_bootloader(android).await?;
        run.session = Some(
            self.detector
                .reconnect(pending, Expect::BootloaderFamily)
                .await?,
        );

        self.lock_bootloader(run).await
    }
}
