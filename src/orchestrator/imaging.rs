//! Imaging stage
//!
//! Resolves the bundle through the artifact cache, inspects it, then either
//! flashes partition images from fastbootd or hands over to the OTA sideload
//! flow. Any failure past resolution invalidates the cached bundle so the next
//! run fetches a fresh copy.

use super::{Flasher, Run};
use crate::archive::{BundleReader, ImagePolicy, PartitionImage, run_blocking};
use crate::cache::CachedArtifact;
use crate::device::Expect;
use crate::device::commands::{REBOOT_FASTBOOT, WIPE_PARTITIONS};
use crate::error::{Error, Result};
use crate::types::{DeviceMode, LogLevel, ProgressEvent, StageOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

const PROGRESS_STAGE: &str = "imaging";

impl Flasher {
    pub(super) async fn image(&self, run: &mut Run<'_>) -> Result<StageOutcome> {
        let artifacts = run.artifacts;
        let Some(source) = artifacts.image.as_ref() else {
            self.reporter.log(
                "No image bundle available for this build, skipping imaging.",
                LogLevel::Warning,
            );
            return Ok(StageOutcome::Continue);
        };

        self.reporter.log("Preparing image bundle...", LogLevel::Info);
        let bundle = self.cache.resolve(source, self.reporter.as_ref()).await?;
        self.reporter.log(
            &format!(
                "Bundle ready: {} ({:.1} MB)",
                bundle.name,
                bundle.size_bytes as f64 / 1_048_576.0
            ),
            LogLevel::Success,
        );
        run.bundle = Some(bundle.clone());

        let result = self.image_bundle(run, &bundle).await;
        match &result {
            Err(e) if !e.is_user_abort() => {
                if let Some(bundle) = run.bundle.take() {
                    warn!(
                        name = %bundle.name,
                        error = %e,
                        "imaging failed, dropping cached bundle"
                    );
                    if let Err(cleanup) = self.cache.invalidate(&bundle).await {
                        warn!(
                            name = %bundle.name,
                            error = %cleanup,
                            "could not invalidate cached bundle"
                        );
                    }
                }
            }
            _ => {}
        }
        result
    }

    async fn image_bundle(
        &self,
        run: &mut Run<'_>,
        bundle: &CachedArtifact,
    ) -> Result<StageOutcome> {
        let path = bundle.path.clone();
        let scratch = self.config.cache.dir.join("scratch");

        let (reader, policy) = run_blocking(move || {
            let mut reader = BundleReader::open(&path)?;
            let policy = reader.plan(&scratch)?;
            Ok((reader, policy))
        })
        .await?;

        match policy {
            ImagePolicy::Ota { payload } => {
                info!(payload = %payload.path, "OTA bundle, installing over sideload");
                drop(reader);
                self.sideload_flow(run, bundle).await?;
                Ok(StageOutcome::SkipLocking)
            }
            ImagePolicy::Partitions { images } => {
                let reader = Arc::new(Mutex::new(reader));
                self.flash_partitions(run, reader, &images).await?;
                Ok(StageOutcome::Continue)
            }
        }
    }

    async fn flash_partitions(
        &self,
        run: &mut Run<'_>,
        reader: Arc<Mutex<BundleReader>>,
        images: &[PartitionImage],
    ) -> Result<()> {
        if run.session()?.mode() != DeviceMode::FastbootUserspace {
            self.reporter
                .log("Switching to fastbootd for flashing...", LogLevel::Info);
            self.reboot_and_reconnect(
                run,
                REBOOT_FASTBOOT,
                Expect::Mode(DeviceMode::FastbootUserspace),
            )
            .await?;
        }

        let total = images.len();
        for (index, image) in images.iter().enumerate() {
            let entry = image.entry.clone();
            let source = reader.clone();
            let data = run_blocking(move || source.lock().read_entry(&entry)).await?;

            self.reporter.log(
                &format!("Flashing {} ({}/{})", image.partition, index + 1, total),
                LogLevel::Info,
            );
            run.session()?
                .write_partition(&image.partition, &data)
                .await
                .map_err(|source| Error::PartitionFlash {
                    partition: image.partition.clone(),
                    source,
                })?;

            self.reporter.report_progress(ProgressEvent::from_bytes(
                PROGRESS_STAGE,
                &image.partition,
                (index + 1) as u64,
                total as u64,
            ));
        }
        info!(count = total, "partition images flashed");

        if run.plan.wipe_data {
            self.reporter.log("Wiping user data...", LogLevel::Info);
            let session = run.session()?;
            for partition in WIPE_PARTITIONS {
                session.run_command(&format!("erase:{partition}")).await?;
            }
        }

        self.reporter.log("Images flashed.", LogLevel::Success);
        Ok(())
    }
}
