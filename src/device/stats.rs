//! Periodic device snapshots for display

use super::commands::{VAR_IS_USERSPACE, VAR_UNLOCKED};
use super::session::DeviceSession;
use crate::reporter::UiReporter;
use crate::types::{DeviceStats, Event, Protocol, UnlockState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The session currently not in use by a run, shared with the stats poller
pub type SessionSlot = Arc<Mutex<Option<DeviceSession>>>;

/// Reads lock state and mode on a fixed interval while no run is active
pub struct StatsPoller {
    slot: SessionSlot,
    interval: Duration,
    reporter: Arc<dyn UiReporter>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl StatsPoller {
    /// Create a stopped poller over `slot`
    pub fn new(slot: SessionSlot, interval: Duration, reporter: Arc<dyn UiReporter>) -> Self {
        Self {
            slot,
            interval,
            reporter,
            running: None,
        }
    }

    /// True while the polling task is alive
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start polling; restarts the task if it was already running
    pub async fn resume(&mut self) {
        self.pause().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            self.slot.clone(),
            self.interval,
            self.reporter.clone(),
            cancel.clone(),
        ));
        self.running = Some((cancel, task));
    }

    /// Stop polling and wait for the task to exit.
    ///
    /// Once this returns no read is in flight on the shared session.
    pub async fn pause(&mut self) -> bool {
        match self.running.take() {
            Some((cancel, task)) => {
                cancel.cancel();
                if let Err(e) = task.await {
                    debug!(error = %e, "stats task ended abnormally");
                }
                true
            }
            None => false,
        }
    }
}

async fn poll_loop(
    slot: SessionSlot,
    interval: Duration,
    reporter: Arc<dyn UiReporter>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let stats = {
            let mut guard = slot.lock().await;
            match guard.as_mut() {
                Some(session) => snapshot(session).await,
                None => None,
            }
        };
        if let Some(stats) = stats {
            reporter.emit(Event::Stats(stats));
        }
    }
}

/// Read one snapshot; only bootloader-family sessions have these variables
pub async fn snapshot(session: &mut DeviceSession) -> Option<DeviceStats> {
    if session.mode().protocol() != Protocol::Bootloader {
        return None;
    }
    let is_userspace = session
        .try_variable(VAR_IS_USERSPACE)
        .await
        .is_some_and(|v| v.eq_ignore_ascii_case("yes"));
    let unlocked = session
        .try_variable(VAR_UNLOCKED)
        .await
        .map(|v| UnlockState::parse(&v))
        .unwrap_or(UnlockState::Unknown);
    Some(DeviceStats {
        is_userspace,
        unlocked,
    })
}
