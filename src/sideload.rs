//! Chunked sideload upload
//!
//! The sideload service needs the total size up front. The payload is then
//! written in fixed-size chunks with progress reported after each one. The
//! device verifies the payload itself; completion here only means every
//! declared byte was written.

use crate::device::DeviceSession;
use crate::error::Result;
use crate::reporter::UiReporter;
use crate::types::{ProgressEvent, SideloadOutcome};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

const PROGRESS_STAGE: &str = "sideload";

/// Drives one sideload upload
pub struct SideloadTransfer {
    chunk_size: usize,
    reporter: Arc<dyn UiReporter>,
}

impl SideloadTransfer {
    /// Transfer writing `chunk_size` bytes per write
    pub fn new(chunk_size: usize, reporter: Arc<dyn UiReporter>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            reporter,
        }
    }

    /// Upload `total` bytes from `source` over a sideload channel on `session`.
    ///
    /// Failing to open the channel is an error. Once it is open, a failed write
    /// or a source that runs dry early yields [`SideloadOutcome::Interrupted`].
    /// The channel is closed on every path.
    pub async fn transfer<R>(
        &self,
        session: &mut DeviceSession,
        source: &mut R,
        total: u64,
        item: &str,
    ) -> Result<SideloadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(serial = %session.serial(), total, "opening sideload channel");
        let mut channel = session.open_sideload(total).await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut offset: u64 = 0;
        let mut outcome = SideloadOutcome::Completed;

        while offset < total {
            let len = (total - offset).min(self.chunk_size as u64) as usize;
            let chunk = &mut buf[..len];

            if let Err(e) = source.read_exact(chunk).await {
                outcome = SideloadOutcome::Interrupted {
                    offset,
                    reason: format!("source ended early: {e}"),
                };
                break;
            }
            if let Err(e) = channel.write(chunk).await {
                outcome = SideloadOutcome::Interrupted {
                    offset,
                    reason: e.to_string(),
                };
                break;
            }

            offset += len as u64;
            self.reporter
                .report_progress(ProgressEvent::from_bytes(PROGRESS_STAGE, item, offset, total));
        }

        if let Err(e) = channel.close().await {
            debug!(error = %e, "closing sideload channel failed");
        }

        match &outcome {
            SideloadOutcome::Completed => info!(bytes = offset, "sideload transfer complete"),
            SideloadOutcome::Interrupted { offset, reason } => {
                warn!(offset, total, %reason, "sideload transfer interrupted")
            }
        }
        Ok(outcome)
    }
}
