//! # device-flasher
//!
//! Backend library for installing custom Android builds on a phone over USB.
//!
//! ## Design Philosophy
//!
//! device-flasher is designed to be:
//! - **Safe by default** - Every irreversible step sits behind a timed confirmation gate
//! - **Library-first** - No UI; a front end subscribes to events and answers gates
//! - **Event-driven** - Logs, progress, countdowns and state changes arrive as [`Event`]s
//! - **Transport-agnostic** - USB access is behind [`device::DeviceProvider`]
//!
//! A run walks `Idle → Connecting → Unlocking → KeyProvisioning → Imaging →
//! Locking → Done`, skipping stages the [`FlashPlan`] leaves out. Any failure
//! ends in `Aborted` with the stage it happened in.
//!
//! ## Quick Start
//!
//! ```no_run
//! use device_flasher::catalog::{HttpCatalog, RemoteCatalog, resolve_artifacts};
//! use device_flasher::device::DeviceProvider;
//! use device_flasher::{Config, EventReporter, FlashPlan, Flasher};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     provider: Arc<dyn DeviceProvider>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.catalog.index_url = "https://builds.example.com/builds_index.json".to_string();
//!
//! let catalog = HttpCatalog::new(&config.catalog, config.retry.clone())?;
//! let builds = catalog.builds().await?;
//! let plan = FlashPlan {
//!     flash_key: true,
//!     flash_zip: true,
//!     lock: true,
//!     ..FlashPlan::default()
//! };
//! let artifacts = resolve_artifacts(&catalog, &plan, builds.first()).await?;
//!
//! let reporter = Arc::new(EventReporter::default());
//! let mut events = reporter.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! // The UI answers gates through `gates`
//! let (mut flasher, gates) = Flasher::new(config, provider, reporter);
//! flasher.run(&plan, &artifacts).await?;
//! # drop(gates);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bundle inspection and image selection
pub mod archive;
/// Download cache for image bundles
pub mod cache;
/// Build index and public key lookup
pub mod catalog;
/// Configuration types
pub mod config;
/// Device sessions, mode detection and the simulated device
pub mod device;
/// Error types
pub mod error;
/// Timed confirmation gates
pub mod gate;
/// Flash state machine (decomposed into per-stage submodules)
pub mod orchestrator;
/// User-facing reporting
pub mod reporter;
/// Bounded polling and retry with backoff
pub mod retry;
/// Chunked sideload upload
pub mod sideload;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result, TransportError, ValidationError};
pub use gate::{ConfirmationGate, GateHandle};
pub use orchestrator::Flasher;
pub use reporter::{EventReporter, NoOpReporter, UiReporter};
pub use types::{
    DeviceMode, Event, FlashPlan, FlashState, GateDecision, ImageSource, LogLevel, ProgressEvent,
    ResolvedArtifacts,
};

/// Run `plan` and abort it cleanly on a termination signal.
///
/// A signal cancels the flasher's [cancellation token](Flasher::cancellation_token),
/// which stops any pending device wait with [`Error::Cancelled`]. The flasher
/// can run again afterwards.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use device_flasher::device::DeviceProvider;
/// use device_flasher::{
///     Config, FlashPlan, Flasher, NoOpReporter, ResolvedArtifacts, run_with_shutdown,
/// };
/// use std::sync::Arc;
///
/// # async fn example(provider: Arc<dyn DeviceProvider>) -> device_flasher::Result<()> {
/// let (mut flasher, _gates) = Flasher::new(Config::default(), provider, Arc::new(NoOpReporter));
/// run_with_shutdown(&mut flasher, &FlashPlan::default(), &ResolvedArtifacts::default()).await
/// # }
/// ```
pub async fn run_with_shutdown(
    flasher: &mut Flasher,
    plan: &FlashPlan,
    artifacts: &ResolvedArtifacts,
) -> Result<()> {
    let cancel = flasher.rearm_cancellation();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    tracing::warn!("termination requested, cancelling run");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    let result = flasher.run(plan, artifacts).await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(
                error = %e,
                "Could not register SIGTERM handler, waiting for SIGINT only"
            );
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(
                error = %e,
                "Could not register SIGINT handler, waiting for SIGTERM only"
            );
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
