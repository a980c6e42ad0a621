// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Scenario tests driving [`Flasher`] against a simulated device.
//!
//! Gates open with a zero-length countdown and every answer comes from a
//! responder task that pops the next queued response (confirm by default).

mod imaging;

use super::*;
use crate::device::mock::{MockDevice, MockProvider};
use crate::gate::{GateHandle, GateResponse};
use crate::reporter::EventReporter;
use crate::types::{Event, FlashState, LogLevel};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub(super) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.cache.dir = dir.path().join("cache");
    config.cache.check_disk_space = false;
    config.gate.window = Duration::ZERO;
    config.gate.acknowledge_timeout = Duration::from_secs(5);
    config.detect.poll_interval = Duration::from_millis(1);
    config.detect.max_ticks = 50;
    config.key.settle_delay = Duration::ZERO;
    config.key.write_backoff = Duration::from_millis(1);
    config.retry.max_attempts = 0;
    config.retry.initial_delay = Duration::from_millis(1);
    config.stats.interval = Duration::from_secs(3600);
    config
}

pub(super) fn key() -> Vec<u8> {
    vec![0x5A; 1032]
}

pub(super) fn plan(configure: impl FnOnce(&mut FlashPlan)) -> FlashPlan {
    let mut plan = FlashPlan::default();
    configure(&mut plan);
    plan
}

pub(super) struct Harness {
    pub(super) flasher: Flasher,
    pub(super) device: MockDevice,
    pub(super) dir: TempDir,
    answers: Arc<SyncMutex<VecDeque<GateResponse>>>,
    prompts: Arc<SyncMutex<Vec<String>>>,
    events: broadcast::Receiver<Event>,
}

impl Harness {
    pub(super) fn new(device: MockDevice) -> Self {
        Self::with_config(device, |_| {})
    }

    pub(super) fn with_config(device: MockDevice, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);

        let reporter = Arc::new(EventReporter::new(4096));
        let events = reporter.subscribe();
        let provider = Arc::new(MockProvider::new(vec![device.clone()]));
        let (flasher, handle) = Flasher::new(config, provider, reporter.clone());

        let answers = Arc::new(SyncMutex::new(VecDeque::new()));
        let prompts = Arc::new(SyncMutex::new(Vec::new()));
        spawn_responder(handle, reporter.subscribe(), answers.clone(), prompts.clone());

        Self {
            flasher,
            device,
            dir,
            answers,
            prompts,
            events,
        }
    }

    /// Queue answers for the next gates, in order
    pub(super) fn answer(&self, responses: &[GateResponse]) {
        self.answers.lock().extend(responses.iter().copied());
    }

    /// Messages of every gate opened so far
    pub(super) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Events published since the last call
    pub(super) fn events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }
}

fn spawn_responder(
    handle: GateHandle,
    mut events: broadcast::Receiver<Event>,
    answers: Arc<SyncMutex<VecDeque<GateResponse>>>,
    prompts: Arc<SyncMutex<Vec<String>>>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::GatePending { message, .. }) => {
                    prompts.lock().push(message);
                    let answer = answers.lock().pop_front().unwrap_or(GateResponse::Confirm);
                    match answer {
                        GateResponse::Confirm => handle.confirm(),
                        GateResponse::Decline => handle.decline(),
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub(super) fn states(events: &[Event]) -> Vec<FlashState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

pub(super) fn logs(events: &[Event]) -> Vec<(LogLevel, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Log { message, level, .. } => Some((*level, message.clone())),
            _ => None,
        })
        .collect()
}

/// The error inside the stage context
pub(super) fn cause(err: &Error) -> &Error {
    match err {
        Error::Stage { source, .. } => source,
        other => other,
    }
}
