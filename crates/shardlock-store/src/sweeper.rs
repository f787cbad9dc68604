//! Expiration sweeping.
//!
//! [`ExpirationSweeper`] is the synchronous Idle → Sweeping → Idle machine:
//! claim one expired session, notify the session-end sink, remove the
//! session, and repeat until nothing is left. [`SweepTimer`] runs it
//! periodically on a tokio runtime and is what the
//! [`SweeperCoordinator`](crate::SweeperCoordinator) starts and stops.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::coordinator::TimerControl;
use crate::error::Result;
use crate::store::{ExpirableStore, ItemState};

/// Error a session-end callback may report.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every session removed by expiration, just before removal.
///
/// Implementations may fail or even panic; the sweeper logs it and removes
/// the session anyway.
pub trait SessionEndSink: Send + Sync {
    fn on_session_end(
        &self,
        session_id: &str,
        state: &ItemState,
    ) -> std::result::Result<(), SinkError>;
}

impl<F> SessionEndSink for F
where
    F: Fn(&str, &ItemState) -> std::result::Result<(), SinkError> + Send + Sync,
{
    fn on_session_end(
        &self,
        session_id: &str,
        state: &ItemState,
    ) -> std::result::Result<(), SinkError> {
        self(session_id, state)
    }
}

/// Sink that ignores session ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionEndSink;

impl SessionEndSink for NoopSessionEndSink {
    fn on_session_end(&self, _: &str, _: &ItemState) -> std::result::Result<(), SinkError> {
        Ok(())
    }
}

/// Whether a sweep is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Sweeping,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was already running; this one did nothing.
    pub skipped: bool,
    /// Sessions removed.
    pub removed: usize,
    /// Session-end callbacks that failed or panicked.
    pub notify_failures: usize,
    /// The sweep stopped early because of cancellation.
    pub cancelled: bool,
}

impl SweepReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Resets the sweeping flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains expired sessions of one application from a store.
pub struct ExpirationSweeper {
    application: String,
    store: Arc<dyn ExpirableStore>,
    sink: Arc<dyn SessionEndSink>,
    clock: Arc<dyn Clock>,
    sweeping: AtomicBool,
}

impl std::fmt::Debug for ExpirationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationSweeper")
            .field("application", &self.application)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ExpirationSweeper {
    pub fn new(
        application: impl Into<String>,
        store: Arc<dyn ExpirableStore>,
        sink: Arc<dyn SessionEndSink>,
    ) -> Self {
        Self {
            application: application.into(),
            store,
            sink,
            clock: Arc::new(SystemClock),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Clock used for the signal time of timer-driven sweeps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn state(&self) -> SweepState {
        if self.sweeping.load(Ordering::Acquire) {
            SweepState::Sweeping
        } else {
            SweepState::Idle
        }
    }

    /// Sweep using the sweeper's clock for the signal time.
    pub fn sweep_now(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        self.sweep(self.clock.now(), cancel)
    }

    /// Remove every session that expired before `signal_time`.
    ///
    /// Returns immediately with [`SweepReport::skipped`] if a sweep is
    /// already running. `cancel` is checked before each session; the store
    /// round trip in flight is allowed to finish.
    pub fn sweep(
        &self,
        signal_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(application = %self.application, "Sweep already in progress, tick dropped");
            return Ok(SweepReport::skipped());
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut report = SweepReport::default();
        loop {
            if cancel.is_cancelled() {
                debug!(application = %self.application, "Sweep cancelled");
                report.cancelled = true;
                break;
            }

            let Some(expired) = self
                .store
                .get_expired_item_exclusive(&self.application, signal_time)?
            else {
                break;
            };

            if !self.notify(&expired.session_id, &expired.state) {
                report.notify_failures += 1;
            }
            self.store
                .remove_item(&self.application, &expired.session_id, &expired.cookie)?;
            report.removed += 1;
            debug!(session_id = %expired.session_id, "Expired session removed");
        }

        if report.removed > 0 {
            info!(
                application = %self.application,
                removed = report.removed,
                notify_failures = report.notify_failures,
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }

    /// Run the session-end callback, containing failures and panics.
    fn notify(&self, session_id: &str, state: &ItemState) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.sink.on_session_end(session_id, state))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Session end callback failed");
                false
            }
            Err(_) => {
                warn!(session_id = %session_id, "Session end callback panicked");
                false
            }
        }
    }
}

struct RunningTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Periodic driver for an [`ExpirationSweeper`].
///
/// Ticks that arrive while a sweep is still running are skipped, not queued.
/// Each sweep runs on the blocking pool since store calls block.
pub struct SweepTimer {
    sweeper: Arc<ExpirationSweeper>,
    interval: Duration,
    runtime: Handle,
    running: Mutex<Option<RunningTimer>>,
}

impl std::fmt::Debug for SweepTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepTimer")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SweepTimer {
    pub fn new(sweeper: Arc<ExpirationSweeper>, interval: Duration, runtime: Handle) -> Self {
        Self {
            sweeper,
            interval,
            runtime,
            running: Mutex::new(None),
        }
    }

    pub fn sweeper(&self) -> &Arc<ExpirationSweeper> {
        &self.sweeper
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }
}

async fn run_timer(sweeper: Arc<ExpirationSweeper>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the first sweep waits a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick_sweeper = Arc::clone(&sweeper);
        let tick_cancel = cancel.clone();
        let outcome =
            tokio::task::spawn_blocking(move || tick_sweeper.sweep_now(&tick_cancel)).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(
                application = %sweeper.application(),
                error = %e,
                "Expiration sweep failed, retrying next tick"
            ),
            Err(e) => warn!(
                application = %sweeper.application(),
                error = %e,
                "Expiration sweep task aborted"
            ),
        }
    }
    debug!(application = %sweeper.application(), "Sweep timer stopped");
}

impl TimerControl for SweepTimer {
    fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let task = self.runtime.spawn(run_timer(
            Arc::clone(&self.sweeper),
            self.interval,
            cancel.clone(),
        ));
        *running = Some(RunningTimer { cancel, task });
        info!(
            application = %self.sweeper.application(),
            interval = ?self.interval,
            "Sweep timer started"
        );
    }

    fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            info!(application = %self.sweeper.application(), "Sweep timer stopping");
        }
    }

    fn is_enabled(&self) -> bool {
        self.is_running()
    }
}

impl Drop for SweepTimer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
