//! Periodic background tasks.
//!
//! A [`ScheduledTask`] runs an async tick closure on a fixed interval until
//! its cancellation token fires or the closure asks to stop. The owner
//! stops it with [`ScheduledTask::stop`], which cancels and joins.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a tick wants the task to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    /// Keep ticking.
    Continue,
    /// Stop the task after this tick.
    Stop,
}

/// A cancellable interval task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    interval: Duration,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Spawns `tick` every `interval` on the current tokio runtime.
    ///
    /// The first tick happens one full interval after spawning. Returns
    /// `None` when `interval` is zero (scheduling disabled) or when no
    /// runtime is available.
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            tracing::debug!(task = %name, "interval is zero; task not scheduled");
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(task = %name, "no tokio runtime available; task not scheduled");
            return None;
        };

        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));

        let task_cancel = cancel.clone();
        let task_running = Arc::clone(&running);
        let task_ticks = Arc::clone(&ticks);
        let task_name = name.clone();

        let handle = runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            timer.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        task_ticks.fetch_add(1, Ordering::Relaxed);
                        if tick().await == TickControl::Stop {
                            tracing::debug!(task = %task_name, "tick requested stop");
                            break;
                        }
                    }
                }
            }
            task_running.store(false, Ordering::SeqCst);
        });

        tracing::debug!(task = %name, ?interval, "scheduled task started");
        Some(Self {
            name,
            interval,
            cancel,
            running,
            ticks,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Task name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the task loop is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of ticks started so far.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Requests cancellation without waiting. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the task and waits for it to finish. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::warn!(task = %self.name, "scheduled task panicked");
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(task = %self.name, ticks = self.tick_count(), "scheduled task stopped");
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
