//! Confirmation gates for irreversible actions
//!
//! A gate shows a warning, runs a countdown during which confirming is not
//! possible, and then waits for the user. Nobody answering is never a yes: once
//! the countdown has run past zero by the configured grace period the gate
//! declines on its own.
//!
//! The UI side holds a [`GateHandle`] and forwards button presses into it. Only
//! one gate can be pending at a time; a second caller gets [`Error::GateBusy`].

use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::reporter::UiReporter;
use crate::types::{Event, GateDecision};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

/// A button press from the UI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateResponse {
    /// Affirmative action
    Confirm,
    /// Decline / cancel
    Decline,
}

/// Sender side held by the UI
#[derive(Clone, Debug)]
pub struct GateHandle {
    tx: mpsc::UnboundedSender<GateResponse>,
}

impl GateHandle {
    /// Press "confirm"; ignored by the gate while its countdown is running
    pub fn confirm(&self) {
        self.tx.send(GateResponse::Confirm).ok();
    }

    /// Press "decline"
    pub fn decline(&self) {
        self.tx.send(GateResponse::Decline).ok();
    }
}

/// Time-boxed yes/no prompt
pub struct ConfirmationGate {
    config: GateConfig,
    responses: Mutex<mpsc::UnboundedReceiver<GateResponse>>,
    reporter: Arc<dyn UiReporter>,
}

impl ConfirmationGate {
    /// Create a gate and the handle the UI uses to answer it
    pub fn new(config: GateConfig, reporter: Arc<dyn UiReporter>) -> (Self, GateHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Self {
            config,
            responses: Mutex::new(rx),
            reporter,
        };
        (gate, GateHandle { tx })
    }

    /// Ask with the configured countdown window
    pub async fn ask(&self, message: &str) -> Result<GateDecision> {
        self.gate(message, self.config.window).await
    }

    /// Show `message`, count down `window`, then wait for an answer.
    ///
    /// Confirm presses before the countdown reaches zero are ignored. The gate
    /// resolves to `Declined` on an explicit decline, when the UI handle is
    /// dropped, or when the countdown has run `grace` past zero.
    pub async fn gate(&self, message: &str, window: Duration) -> Result<GateDecision> {
        let mut responses = self.responses.try_lock().map_err(|_| Error::GateBusy)?;

        // Presses that arrived while no gate was open do not count
        while responses.try_recv().is_ok() {}

        let window_secs = window.as_secs();
        let floor = -(self.config.grace.as_secs() as i64);
        let mut remaining = window_secs as i64;

        info!(window_secs, "confirmation gate opened");
        self.reporter.emit(Event::GatePending {
            message: message.to_string(),
            window_secs,
        });

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;

        let decision = loop {
            tokio::select! {
                response = responses.recv() => match response {
                    Some(GateResponse::Confirm) if remaining <= 0 => break GateDecision::Confirmed,
                    Some(GateResponse::Confirm) => {
                        debug!(remaining, "confirm ignored while countdown is running");
                    }
                    Some(GateResponse::Decline) => break GateDecision::Declined,
                    None => {
                        debug!("gate handle dropped");
                        break GateDecision::Declined;
                    }
                },
                _ = ticker.tick() => {
                    remaining -= 1;
                    self.reporter.emit(Event::GateTick { remaining_secs: remaining });
                    if remaining <= floor {
                        info!("confirmation gate timed out");
                        break GateDecision::Declined;
                    }
                }
            }
        };

        info!(?decision, "confirmation gate closed");
        self.reporter.emit(Event::GateClosed { decision });
        Ok(decision)
    }

    /// Wait for the user to acknowledge a manual step, without a countdown.
    ///
    /// Resolves to `Declined` on decline or after `acknowledge_timeout`.
    pub async fn acknowledge(&self, message: &str) -> Result<GateDecision> {
        let mut responses = self.responses.try_lock().map_err(|_| Error::GateBusy)?;
        while responses.try_recv().is_ok() {}

        self.reporter.emit(Event::GatePending {
            message: message.to_string(),
            window_secs: 0,
        });

        let reply = tokio::time::timeout(self.config.acknowledge_timeout, responses.recv()).await;
        let decision = match reply {
            Ok(Some(GateResponse::Confirm)) => GateDecision::Confirmed,
            Ok(Some(GateResponse::Decline)) | Ok(None) => GateDecision::Declined,
            Err(_) => {
                info!("acknowledgement timed out");
                GateDecision::Declined
            }
        };

        self.reporter.emit(Event::GateClosed { decision });
        Ok(decision)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{EventReporter, NoOpReporter};

    fn gate() -> (Arc<ConfirmationGate>, GateHandle) {
        let (gate, handle) = ConfirmationGate::new(GateConfig::default(), Arc::new(NoOpReporter));
        (Arc::new(gate), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_during_countdown_is_ignored() {
        let (gate, handle) = gate();
        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.gate("wipe?", Duration::from_secs(60)).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.confirm();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!pending.is_finished());

        tokio::time::sleep(Duration::from_secs(45)).await;
        handle.confirm();

        assert_eq!(pending.await.unwrap().unwrap(), GateDecision::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_presses_are_drained_before_opening() {
        let (gate, handle) = gate();
        handle.decline();

        // stale presses are drained, so this decline must arrive after opening
        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.ask("lock?").await }
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.decline();

        assert_eq!(pending.await.unwrap().unwrap(), GateDecision::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_gate_declines_after_grace_period() {
        let (gate, _handle) = gate();
        let start = tokio::time::Instant::now();

        let decision = gate.gate("unlock?", Duration::from_secs(60)).await.unwrap();

        assert_eq!(decision, GateDecision::Declined);
        assert_eq!(start.elapsed(), Duration::from_secs(60 + 300));
    }

    #[tokio::test(start_paused = true)]
    async fn second_gate_while_pending_is_rejected() {
        let (gate, handle) = gate();
        let first = tokio::spawn({
            let gate = gate.clone();
            async move { gate.ask("first").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(gate.ask("second").await, Err(Error::GateBusy)));

        handle.decline();
        assert_eq!(first.await.unwrap().unwrap(), GateDecision::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_declines() {
        let (gate, handle) = gate();
        drop(handle);

        assert_eq!(gate.ask("unlock?").await.unwrap(), GateDecision::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_are_published() {
        let reporter = Arc::new(EventReporter::new(1024));
        let mut events = reporter.subscribe();
        let (gate, handle) = ConfirmationGate::new(GateConfig::default(), reporter);
        let gate = Arc::new(gate);

        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.gate("go?", Duration::from_secs(3)).await }
        });
        tokio::time::sleep(Duration::from_millis(4500)).await;
        handle.confirm();
        assert_eq!(pending.await.unwrap().unwrap(), GateDecision::Confirmed);

        let mut ticks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::GateTick { remaining_secs } = event {
                ticks.push(remaining_secs);
            }
        }
        assert_eq!(&ticks[..4], &[2, 1, 0, -1]);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_accepts_confirm_without_countdown() {
        let (gate, handle) = gate();
        handle.confirm();
        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acknowledge("booted fine?").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.confirm();

        assert_eq!(pending.await.unwrap().unwrap(), GateDecision::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_times_out_to_declined() {
        let (gate, _handle) = gate();
        assert_eq!(gate.acknowledge("booted?").await.unwrap(), GateDecision::Declined);
    }
}
