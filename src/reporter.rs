//! User-facing reporting
//!
//! The orchestrator never talks to a UI directly. It hands log lines, progress and
//! richer lifecycle events to a [`UiReporter`]. [`EventReporter`] mirrors everything
//! into `tracing` and publishes [`Event`]s on a broadcast channel so any number of
//! consumers can subscribe.

use crate::types::{Event, LogLevel, ProgressEvent};
use chrono::Utc;
use tokio::sync::broadcast;

/// One-way, fire-and-forget sink for user-facing output
pub trait UiReporter: Send + Sync {
    /// Record a log line
    fn log(&self, message: &str, level: LogLevel);

    /// Report progress of a long-running item
    fn report_progress(&self, event: ProgressEvent);

    /// Publish a lifecycle event (gate countdowns, state changes, stats)
    fn emit(&self, event: Event) {
        let _ = event;
    }
}

/// Reporter that writes to `tracing` and a broadcast channel
#[derive(Clone)]
pub struct EventReporter {
    event_tx: broadcast::Sender<Event>,
}

impl EventReporter {
    /// Create a reporter with a channel of the given capacity
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _rx) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Subscribe to events
    ///
    /// Slow subscribers that fall more than `capacity` events behind see
    /// `RecvError::Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn send(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl UiReporter for EventReporter {
    fn log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!(?level, "{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.send(Event::Log {
            message: message.to_string(),
            level,
            at: Utc::now(),
        });
    }

    fn report_progress(&self, event: ProgressEvent) {
        tracing::trace!(
            stage = %event.stage,
            item = %event.item,
            fraction = event.fraction,
            "progress"
        );
        self.send(Event::Progress(event));
    }

    fn emit(&self, event: Event) {
        tracing::debug!(?event, "event");
        self.send(event);
    }
}

/// Reporter that discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpReporter;

impl UiReporter for NoOpReporter {
    fn log(&self, _message: &str, _level: LogLevel) {}

    fn report_progress(&self, _event: ProgressEvent) {}
}
