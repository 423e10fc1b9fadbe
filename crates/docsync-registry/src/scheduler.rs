//! Flush scheduling
//!
//! Triggers are cheap and synchronous. Any number of triggers that arrive
//! while a run is waiting or in flight collapse into a single further run,
//! and consecutive runs start at least `min_interval` apart.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Scheduler configuration
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Minimum spacing between the starts of two runs
    pub min_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// Create from a maximum number of runs per second
    pub fn from_frequency(max_frequency: f64) -> Self {
        let nanos = if max_frequency > 0.0 {
            (1e9 / max_frequency) as u64
        } else {
            0
        };
        Self::new(Duration::from_nanos(nanos))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_frequency(crate::config::DEFAULT_MAX_FLUSH_FREQUENCY)
    }
}

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Coalescing, frequency-limited task runner
///
/// Owned by one registry; several schedulers never share state.
pub struct UpdateScheduler {
    config: SchedulerConfig,
    notify: Arc<Notify>,
    runs: Arc<AtomicU64>,
    worker: Mutex<Option<Worker>>,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            notify: Arc::new(Notify::new()),
            runs: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Request a run. Triggers before `start` are kept for the first run.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Spawn the loop that runs `task` on triggers.
    ///
    /// Returns `false` if the scheduler is already running.
    pub fn start<F, Fut>(&self, task: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Scheduler already running");
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.config,
            self.notify.clone(),
            self.runs.clone(),
            stop_rx,
            task,
        ));
        *worker = Some(Worker { stop, task });
        true
    }

    /// Stop the loop, waiting for a run in flight to finish.
    ///
    /// Triggers that have not started a run yet are dropped.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let _ = worker.stop.send(true);
        if let Err(e) = worker.task.await {
            error!(error = %e, "Scheduler task failed");
        }
        debug!(runs = self.runs(), "Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Number of completed runs
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.task.abort();
        }
    }
}

async fn run_loop<F, Fut>(
    config: SchedulerConfig,
    notify: Arc<Notify>,
    runs: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut last_start: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = notify.notified() => {}
        }

        if let Some(last) = last_start {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep_until(last + config.min_interval) => {}
            }
        }

        last_start = Some(Instant::now());
        task().await;
        runs.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(scheduler: &UpdateScheduler, work: Duration) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        scheduler.start(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(work).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[tokio::test]
    async fn test_triggers_coalesce() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::from_frequency(1000.0));
        let count = counting(&scheduler, Duration::ZERO);

        for _ in 0..10 {
            scheduler.trigger();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_triggers_during_run_give_one_more_run() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::from_frequency(1000.0));
        let count = counting(&scheduler, Duration::from_millis(50));

        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            scheduler.trigger();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.runs(), 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::from_frequency(1000.0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let active = active.clone();
            let peak = peak.clone();
            scheduler.start(move || {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        for _ in 0..20 {
            scheduler.trigger();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        scheduler.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(scheduler.runs() > 1);
    }

    #[tokio::test]
    async fn test_runs_are_spaced_by_min_interval() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::new(Duration::from_millis(150)));
        let count = counting(&scheduler, Duration::ZERO);

        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_before_start_runs_once_started() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::default());
        scheduler.trigger();

        let count = counting(&scheduler, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let scheduler = UpdateScheduler::new(SchedulerConfig::from_frequency(1000.0));
        let count = counting(&scheduler, Duration::ZERO);
        assert!(scheduler.is_running());
        assert!(!scheduler.start(|| async {}));

        scheduler.stop().await;
        assert!(!scheduler.is_running());

        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
