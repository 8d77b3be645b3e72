//! Periodic scheduler for collection jobs.
//!
//! One cooperative loop waits on an injected [`Timer`]. Each fire runs a tick
//! that submits one job per due source to a [`JobSink`]. Ticks never overlap:
//! a fire that arrives while the previous tick is still running is skipped.

use async_trait::async_trait;
use pressroom_core::config::SchedulerConfig;
use pressroom_core::{PressroomError, PressroomResult};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A named source collected on a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSource {
    pub key: String,
    pub interval: Duration,
}

impl ScheduledSource {
    pub fn new(key: impl Into<String>, interval: Duration) -> Self {
        Self {
            key: key.into(),
            interval,
        }
    }
}

/// Where scheduled jobs go.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Queue one job for `source`. `None` means the request was dropped.
    async fn submit(&self, source: &ScheduledSource) -> PressroomResult<Option<Uuid>>;
}

/// Produces tick streams for the scheduler loop.
pub trait Timer: Send + Sync {
    fn ticker(&self) -> Box<dyn Ticker>;
    fn period(&self) -> Duration;
}

#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next fire. `false` once the timer can no longer fire.
    async fn tick(&mut self) -> bool;
}

/// Wall-clock timer. The first tick fires immediately.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    period: Duration,
}

impl IntervalTimer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Timer for IntervalTimer {
    fn ticker(&self) -> Box<dyn Ticker> {
        let mut interval = tokio::time::interval_at(Instant::now(), self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Box::new(IntervalTicker { interval })
    }

    fn period(&self) -> Duration {
        self.period
    }
}

struct IntervalTicker {
    interval: tokio::time::Interval,
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Timer that only fires when [`ManualTimer::fire`] is called.
#[derive(Debug, Clone)]
pub struct ManualTimer {
    period: Duration,
    tx: broadcast::Sender<()>,
}

impl ManualTimer {
    pub fn new(period: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { period, tx }
    }

    /// Fire once. Returns how many tickers were listening.
    pub fn fire(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }
}

impl Timer for ManualTimer {
    fn ticker(&self) -> Box<dyn Ticker> {
        Box::new(ManualTicker {
            rx: self.tx.subscribe(),
        })
    }

    fn period(&self) -> Duration {
        self.period
    }
}

struct ManualTicker {
    rx: broadcast::Receiver<()>,
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Zero-based index of this tick.
    pub tick: u64,
    pub submitted: usize,
    pub dropped: usize,
    pub failed: usize,
}

struct ScheduledEntry {
    source: ScheduledSource,
    every: u64,
}

struct Inner {
    entries: Vec<ScheduledEntry>,
    sink: Arc<dyn JobSink>,
    tick_guard: Arc<Mutex<()>>,
    next_tick: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
}

impl Inner {
    /// Handle a timer fire: start a tick unless one is already running.
    fn fire(self: &Arc<Self>) {
        match self.tick_guard.clone().try_lock_owned() {
            Ok(guard) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.run_locked(guard).await;
                });
            }
            Err(_) => {
                let skipped = self.skipped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(skipped, "Previous tick still running, skipping this one");
            }
        }
    }

    async fn run_locked(&self, _guard: OwnedMutexGuard<()>) -> TickReport {
        let tick = self.next_tick.fetch_add(1, Ordering::SeqCst);
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        for entry in self.entries.iter().filter(|e| tick % e.every == 0) {
            let key = entry.source.key.as_str();
            match self.sink.submit(&entry.source).await {
                Ok(Some(task_id)) => {
                    debug!(tick, source = %key, task_id = %task_id, "Job submitted");
                    report.submitted += 1;
                }
                Ok(None) => report.dropped += 1,
                Err(e) => {
                    warn!(tick, source = %key, error = %e, "Failed to submit job, continuing");
                    report.failed += 1;
                }
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        info!(
            tick,
            submitted = report.submitted,
            dropped = report.dropped,
            failed = report.failed,
            "Scheduler tick finished"
        );
        report
    }
}

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Fires collection jobs for every registered source on a fixed period.
pub struct Scheduler {
    inner: Arc<Inner>,
    timer: Arc<dyn Timer>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    /// Sources are fixed for the scheduler's lifetime. Keys must be unique and
    /// intervals non-zero.
    pub fn new(
        sources: Vec<ScheduledSource>,
        sink: Arc<dyn JobSink>,
        timer: Arc<dyn Timer>,
    ) -> PressroomResult<Self> {
        let period = timer.period();
        if period.is_zero() {
            return Err(PressroomError::Config(
                "scheduler period must be non-zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(sources.len());
        for source in sources {
            if source.interval.is_zero() {
                return Err(PressroomError::Config(format!(
                    "source '{}' has a zero interval",
                    source.key
                )));
            }
            if !seen.insert(source.key.clone()) {
                return Err(PressroomError::Config(format!(
                    "duplicate source key '{}'",
                    source.key
                )));
            }
            let every = source.interval.as_nanos().div_ceil(period.as_nanos()).max(1);
            entries.push(ScheduledEntry {
                source,
                every: u64::try_from(every).unwrap_or(u64::MAX),
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                entries,
                sink,
                tick_guard: Arc::new(Mutex::new(())),
                next_tick: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
            timer,
            running: Mutex::new(None),
        })
    }

    /// Build from configuration with a wall-clock timer.
    pub fn from_config(config: &SchedulerConfig, sink: Arc<dyn JobSink>) -> PressroomResult<Self> {
        let period = config.interval();
        let sources = config
            .sources
            .iter()
            .map(|s| ScheduledSource::new(s.key.clone(), s.interval_or(period)))
            .collect();
        Self::new(sources, sink, Arc::new(IntervalTimer::new(period)))
    }

    pub fn sources(&self) -> impl Iterator<Item = &ScheduledSource> {
        self.inner.entries.iter().map(|e| &e.source)
    }

    /// Start the timer loop. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Scheduler already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut ticker = self.timer.ticker();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    alive = ticker.tick() => {
                        if !alive {
                            break;
                        }
                        inner.fire();
                    }
                }
            }
        });

        info!(
            sources = self.inner.entries.len(),
            period_secs = self.timer.period().as_secs_f64(),
            "Scheduler started"
        );
        *running = Some(Running { handle, shutdown });
    }

    /// Stop the timer loop and wait for a tick in flight to finish. Calling it
    /// when stopped does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        if running.shutdown.send(true).is_err() {
            debug!("Scheduler loop already exited");
        }
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        let _idle = self.inner.tick_guard.lock().await;
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one tick now, outside the timer. Returns `None` if a tick is
    /// already in flight.
    pub async fn run_tick(&self) -> Option<TickReport> {
        match self.inner.tick_guard.clone().try_lock_owned() {
            Ok(guard) => Some(self.inner.run_locked(guard).await),
            Err(_) => {
                self.inner.skipped.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn ticks_completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.inner.skipped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobSink for RecordingSink {
        async fn submit(&self, source: &ScheduledSource) -> PressroomResult<Option<Uuid>> {
            self.calls.lock().await.push(source.key.clone());
            Ok(Some(Uuid::new_v4()))
        }
    }

    /// Blocks every submit until a permit is released.
    struct GatedSink {
        gate: Semaphore,
        entered: AtomicU64,
    }

    #[async_trait]
    impl JobSink for GatedSink {
        async fn submit(&self, _source: &ScheduledSource) -> PressroomResult<Option<Uuid>> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| PressroomError::Fatal(e.to_string()))?;
            permit.forget();
            Ok(Some(Uuid::new_v4()))
        }
    }

    struct FlakySink {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobSink for FlakySink {
        async fn submit(&self, source: &ScheduledSource) -> PressroomResult<Option<Uuid>> {
            self.calls.lock().await.push(source.key.clone());
            if source.key == "broken" {
                return Err(PressroomError::Retryable("broker unavailable".into()));
            }
            Ok(Some(Uuid::new_v4()))
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn hourly(keys: &[&str]) -> Vec<ScheduledSource> {
        keys.iter()
            .map(|k| ScheduledSource::new(*k, Duration::from_secs(3600)))
            .collect()
    }

    #[tokio::test]
    async fn test_run_tick_submits_every_source() {
        let sink = Arc::new(RecordingSink::default());
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(3600)));
        let scheduler = Scheduler::new(hourly(&["lol", "valorant", "tft"]), sink.clone(), timer)
            .unwrap();

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.tick, 0);
        assert_eq!(report.submitted, 3);
        assert_eq!(*sink.calls.lock().await, vec!["lol", "valorant", "tft"]);
    }

    #[tokio::test]
    async fn test_failing_source_does_not_abort_tick() {
        let sink = Arc::new(FlakySink {
            calls: Mutex::new(Vec::new()),
        });
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(60)));
        let scheduler = Scheduler::new(
            vec![
                ScheduledSource::new("lol", Duration::from_secs(60)),
                ScheduledSource::new("broken", Duration::from_secs(60)),
                ScheduledSource::new("tft", Duration::from_secs(60)),
            ],
            sink.clone(),
            timer,
        )
        .unwrap();

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(sink.calls.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_slower_source_fires_every_nth_tick() {
        let sink = Arc::new(RecordingSink::default());
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(60)));
        let scheduler = Scheduler::new(
            vec![
                ScheduledSource::new("fast", Duration::from_secs(60)),
                ScheduledSource::new("slow", Duration::from_secs(150)),
            ],
            sink.clone(),
            timer,
        )
        .unwrap();

        for _ in 0..4 {
            scheduler.run_tick().await.unwrap();
        }
        let calls = sink.calls.lock().await;
        assert_eq!(calls.iter().filter(|k| *k == "fast").count(), 4);
        // Every third tick: ticks 0 and 3.
        assert_eq!(calls.iter().filter(|k| *k == "slow").count(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_fire_is_skipped() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
            entered: AtomicU64::new(0),
        });
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(1)));
        let scheduler = Scheduler::new(hourly(&["lol"]), sink.clone(), timer.clone()).unwrap();
        scheduler.start().await;

        timer.fire();
        wait_until(|| sink.entered.load(Ordering::SeqCst) == 1).await;
        timer.fire();
        wait_until(|| scheduler.ticks_skipped() == 1).await;
        assert_eq!(scheduler.ticks_completed(), 0);

        sink.gate.add_permits(1);
        wait_until(|| scheduler.ticks_completed() == 1).await;
        assert_eq!(sink.entered.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_tick() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
            entered: AtomicU64::new(0),
        });
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(1)));
        let scheduler = Arc::new(Scheduler::new(hourly(&["lol"]), sink.clone(), timer.clone()).unwrap());
        scheduler.start().await;
        timer.fire();
        wait_until(|| sink.entered.load(Ordering::SeqCst) == 1).await;

        let stopping = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        sink.gate.add_permits(1);
        stopping.await.unwrap();
        assert_eq!(scheduler.ticks_completed(), 1);
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let timer = Arc::new(ManualTimer::new(Duration::from_secs(1)));
        let scheduler = Scheduler::new(hourly(&["lol"]), sink.clone(), timer.clone()).unwrap();

        scheduler.stop().await;
        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);
        // One loop means one listener.
        assert_eq!(timer.fire(), 1);
        wait_until(|| scheduler.ticks_completed() == 1).await;

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        assert_eq!(timer.fire(), 0);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_zero_interval_sources() {
        let sink: Arc<dyn JobSink> = Arc::new(RecordingSink::default());
        let timer: Arc<dyn Timer> = Arc::new(ManualTimer::new(Duration::from_secs(1)));

        let dup = Scheduler::new(hourly(&["lol", "lol"]), sink.clone(), timer.clone());
        assert!(matches!(dup, Err(PressroomError::Config(_))));

        let zero = Scheduler::new(
            vec![ScheduledSource::new("lol", Duration::ZERO)],
            sink,
            timer,
        );
        assert!(matches!(zero, Err(PressroomError::Config(_))));
    }

    #[tokio::test]
    async fn test_interval_timer_fires_immediately() {
        let timer = IntervalTimer::new(Duration::from_secs(3600));
        let mut ticker = timer.ticker();
        let fired = tokio::time::timeout(Duration::from_secs(1), ticker.tick()).await;
        assert_eq!(fired.ok(), Some(true));
    }
}
