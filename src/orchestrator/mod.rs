//! Flash orchestrator
//!
//! [`Flasher`] runs one [`FlashPlan`] at a time through the state machine
//! `Idle → Connecting → Unlocking → KeyProvisioning → Imaging → Locking → Done`,
//! with `Aborted` reachable from every non-terminal state. Stages live in
//! focused submodules:
//! - [`connect`] - acquire a session, moving ADB devices to the bootloader
//! - [`unlock`] - gated bootloader unlock
//! - [`key`] - custom AVB key validation and provisioning
//! - [`imaging`] - bundle resolution and partition flashing
//! - [`sideload_flow`] - OTA install over sideload, with its own lock step
//! - [`lock`] - gated bootloader lock
//! - [`transitions`] - the transition table
//!
//! The flasher owns the device session. Between runs it sits in a shared slot
//! that the [`StatsPoller`] reads from; the poller is paused for the whole run.

mod connect;
mod imaging;
mod key;
mod lock;
mod sideload_flow;
mod transitions;
mod unlock;

#[cfg(test)]
mod tests;

pub use key::validate_key;
pub use transitions::{next_state, stage_enabled};

use crate::cache::{ArtifactCache, CachedArtifact};
use crate::config::Config;
use crate::device::commands::{ADB_REBOOT, REBOOT};
use crate::device::{
    DeviceProvider, DeviceSession, Expect, ModeDetector, SessionSlot, StatsPoller, adb,
};
use crate::error::{Error, Result};
use crate::gate::{ConfirmationGate, GateHandle};
use crate::reporter::UiReporter;
use crate::types::{
    DeviceInfo, DeviceMode, Event, FlashPlan, FlashState, LogLevel, Protocol, ResolvedArtifacts,
    StageOutcome,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives flashing runs against one device
pub struct Flasher {
    config: Config,
    detector: ModeDetector,
    cache: ArtifactCache,
    gate: ConfirmationGate,
    reporter: Arc<dyn UiReporter>,
    slot: SessionSlot,
    stats: StatsPoller,
    cancel: CancellationToken,
    state: FlashState,
}

/// State of one run
pub(crate) struct Run<'a> {
    plan: &'a FlashPlan,
    artifacts: &'a ResolvedArtifacts,
    session: Option<DeviceSession>,
    /// Bundle resolved by the imaging stage, invalidated if imaging fails
    bundle: Option<CachedArtifact>,
}

impl Run<'_> {
    fn session(&mut self) -> Result<&mut DeviceSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::DeviceState("no device session".to_string()))
    }

    fn take_session(&mut self) -> Result<DeviceSession> {
        self.session
            .take()
            .ok_or_else(|| Error::DeviceState("no device session".to_string()))
    }
}

impl Flasher {
    /// Create a flasher and the handle the UI answers confirmation gates with
    pub fn new(
        config: Config,
        provider: Arc<dyn DeviceProvider>,
        reporter: Arc<dyn UiReporter>,
    ) -> (Self, GateHandle) {
        let cancel = CancellationToken::new();
        let detector =
            ModeDetector::new(provider, config.detect.clone()).with_cancellation(cancel.clone());
        let cache = ArtifactCache::new(config.cache.clone(), config.retry.clone());
        let (gate, handle) = ConfirmationGate::new(config.gate.clone(), reporter.clone());
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let stats = StatsPoller::new(slot.clone(), config.stats.interval, reporter.clone());

        let flasher = Self {
            config,
            detector,
            cache,
            gate,
            reporter,
            slot,
            stats,
            cancel,
            state: FlashState::Idle,
        };
        (flasher, handle)
    }

    /// Replace the artifact cache (custom storage or HTTP client)
    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = cache;
        self
    }

    /// Let device waits be cancelled from outside
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.detector = self.detector.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Token that stops device waits; cancelling it aborts the current run.
    ///
    /// A token left cancelled by an earlier run is replaced when the next run
    /// or attach starts, so fetch it again for every run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token for the run about to start
    pub(crate) fn rearm_cancellation(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            debug!("replacing cancelled token");
            self.cancel = CancellationToken::new();
            self.detector.set_cancellation(self.cancel.clone());
        }
        self.cancel.clone()
    }

    /// Current state
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Slot holding the idle session between runs
    pub fn session_slot(&self) -> SessionSlot {
        self.slot.clone()
    }

    /// True while stats polling is active
    pub fn is_polling(&self) -> bool {
        self.stats.is_running()
    }

    /// Find a device, keep its session for the next run and start stats polling
    pub async fn attach(&mut self) -> Result<DeviceMode> {
        self.rearm_cancellation();
        self.stats.pause().await;
        if let Some(old) = self.slot.lock().await.take() {
            old.close().await;
        }

        let session = self.detector.wait_for(Expect::Any).await?;
        let mode = session.mode();
        self.reporter.log(
            &format!("Connected to {} ({})", session.serial(), mode),
            LogLevel::Success,
        );
        *self.slot.lock().await = Some(session);
        self.stats.resume().await;
        Ok(mode)
    }

    /// Stop polling and close the idle session
    pub async fn detach(&mut self) {
        self.stats.pause().await;
        if let Some(session) = self.slot.lock().await.take() {
            session.close().await;
        }
    }

    /// Model, release and battery level of an attached device running Android
    pub async fn device_info(&self) -> Result<Option<DeviceInfo>> {
        let mut guard = self.slot.lock().await;
        match guard.as_mut() {
            Some(session) if session.mode().protocol() == Protocol::Adb => {
                Ok(Some(adb::fetch_info(session).await?))
            }
            _ => Ok(None),
        }
    }

    /// Execute `plan`.
    ///
    /// Either every planned stage completes, or the run stops at the first
    /// failure and returns it wrapped with the stage it happened in. A declined
    /// gate is reported as information, not as an error, but still ends the run.
    pub async fn run(&mut self, plan: &FlashPlan, artifacts: &ResolvedArtifacts) -> Result<()> {
        self.state = FlashState::Idle;
        self.rearm_cancellation();
        info!(?plan, "starting flash run");

        if self.stats.pause().await {
            debug!("stats polling paused for the run");
        }
        let session = self.slot.lock().await.take();
        let mut run = Run {
            plan,
            artifacts,
            session,
            bundle: None,
        };

        let result = self.drive(&mut run).await;

        match &result {
            Ok(()) => {
                self.transition(FlashState::Done);
                self.reporter
                    .log("Looking good! Process finished.", LogLevel::Success);
                if let Some(session) = self.finish(&mut run).await {
                    *self.slot.lock().await = Some(session);
                    self.stats.resume().await;
                }
            }
            Err(e) => {
                self.transition(FlashState::Aborted);
                if let Some(session) = run.session.take() {
                    session.close().await;
                }
                if e.is_user_abort() {
                    info!(error = %e, "run stopped by user");
                    self.reporter.log(&format!("Run cancelled: {e}"), LogLevel::Info);
                } else {
                    error!(error = %e, "run failed");
                    self.reporter.log(&format!("CRITICAL ERROR: {e}"), LogLevel::Error);
                }
            }
        }

        self.reporter.emit(Event::RunFinished {
            state: self.state,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn drive(&mut self, run: &mut Run<'_>) -> Result<()> {
        let mut state = next_state(FlashState::Idle, StageOutcome::Continue);
        while !state.is_terminal() {
            if !stage_enabled(state, run.plan) {
                debug!(%state, "stage not in plan");
                state = next_state(state, StageOutcome::Continue);
                continue;
            }

            self.transition(state);
            let outcome = self
                .run_stage(state, run)
                .await
                .map_err(|e| e.in_stage(state))?;
            state = next_state(state, outcome);
        }
        Ok(())
    }

    async fn run_stage(&self, state: FlashState, run: &mut Run<'_>) -> Result<StageOutcome> {
        match state {
            FlashState::Connecting => self.connect(run).await,
            FlashState::Unlocking => self.unlock(run).await,
            FlashState::KeyProvisioning => self.provision_key(run).await,
            FlashState::Imaging => self.image(run).await,
            FlashState::Locking => self.lock(run).await,
            FlashState::Idle | FlashState::Done | FlashState::Aborted => Ok(StageOutcome::Continue),
        }
    }

    fn transition(&mut self, to: FlashState) {
        let from = self.state;
        info!(%from, %to, "state change");
        self.state = to;
        self.reporter.emit(Event::StateChanged { from, to });
    }

    /// Hand the session back for the idle slot, or reboot the device if planned
    async fn finish(&self, run: &mut Run<'_>) -> Option<DeviceSession> {
        let session = run.session.take()?;
        if !run.plan.auto_reboot {
            return Some(session);
        }

        self.reporter.log("Rebooting device...", LogLevel::Info);
        let command = match session.mode().protocol() {
            Protocol::Bootloader => REBOOT,
            Protocol::Adb => ADB_REBOOT,
        };
        // Best effort: the device is leaving either way
        match session.reboot(command).await {
            Ok(pending) => pending.abandon().await,
            Err(e) => warn!(error = %e, "final reboot failed"),
        }
        None
    }

    /// Issue a command that reboots the device and wait for it to come back
    async fn reboot_and_reconnect(
        &self,
        run: &mut Run<'_>,
        command: &str,
        expect: Expect,
    ) -> Result<()> {
        let session = run.take_session()?;
        let pending = session.reboot(command).await?;
        run.session = Some(self.detector.reconnect(pending, expect).await?);
        Ok(())
    }

    fn action_required(&self, message: &str) {
        self.reporter.log(&format!("ACTION REQUIRED: {message}"), LogLevel::Warning);
        self.reporter.emit(Event::ActionRequired {
            message: message.to_string(),
        });
    }
}
