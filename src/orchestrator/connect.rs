//! Connecting stage

use super::{Flasher, Run};
use crate::device::commands::VAR_PRODUCT;
use crate::device::{Expect, adb};
use crate::error::Result;
use crate::types::{LogLevel, Protocol, StageOutcome};
use tracing::info;

impl Flasher {
    /// Acquire a session, reusing the attached one when there is one.
    ///
    /// A device running Android is rebooted into the bootloader first. The
    /// product variable is read as a liveness probe; failure is fatal.
    pub(super) async fn connect(&self, run: &mut Run<'_>) -> Result<StageOutcome> {
        let mut session = match run.session.take() {
            Some(session) => session,
            None => {
                self.reporter.log("Connecting to USB device...", LogLevel::Info);
                self.detector.wait_for(Expect::Any).await?
            }
        };

        if session.mode().protocol() == Protocol::Adb {
            self.reporter.log(
                "Device is running Android, rebooting to bootloader...",
                LogLevel::Info,
            );
            let pending = adb::reboot_to_bootloader(session).await?;
            session = self
                .detector
                .reconnect(pending, Expect::BootloaderFamily)
                .await?;
        }

        let session = run.session.insert(session);
        let product = session.get_variable(VAR_PRODUCT).await?;
        info!(serial = %session.serial(), %product, mode = %session.mode(), "device connected");
        self.reporter.log(
            &format!("Connected: {} ({})", product, session.mode()),
            LogLevel::Success,
        );
        Ok(StageOutcome::Continue)
    }
}
