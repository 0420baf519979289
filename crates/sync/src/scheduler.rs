// Sync scheduling: turns enqueue notifications into sync passes.
//
// A pass starts as soon as the queue reaches the threshold, otherwise after a
// quiet window with no new changes (each change resets the timer).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::sync::SessionSyncService;

const DEFAULT_DEBOUNCE_MS: u64 = 1_500;
const MIN_DEBOUNCE_MS: u64 = 250;
const MAX_DEBOUNCE_MS: u64 = 10_000;
const DEFAULT_QUEUE_THRESHOLD: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub window: Duration,
    pub queue_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            queue_threshold: DEFAULT_QUEUE_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    /// Window clamped to [250, 10000] ms; a zero threshold becomes 1.
    pub fn new(debounce_ms: u64, queue_threshold: usize) -> Self {
        Self {
            window: Duration::from_millis(debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS)),
            queue_threshold: queue_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Queue reached the threshold; sync now.
    Immediate,
    /// Wait for the quiet window.
    Deferred,
}

/// Pure timing logic, driven with explicit instants in tests.
#[derive(Debug)]
pub struct Debounce {
    config: SchedulerConfig,
    last_change: Option<Instant>,
}

impl Debounce {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config, last_change: None }
    }

    pub fn push(&mut self, queue_len: usize) -> Trigger {
        self.push_at(queue_len, Instant::now())
    }

    fn push_at(&mut self, queue_len: usize, now: Instant) -> Trigger {
        if queue_len >= self.config.queue_threshold {
            self.last_change = None;
            return Trigger::Immediate;
        }
        self.last_change = Some(now);
        Trigger::Deferred
    }

    /// True once the quiet window has elapsed; clears the pending change.
    pub fn take_ready(&mut self) -> bool {
        self.take_ready_at(Instant::now())
    }

    fn take_ready_at(&mut self, now: Instant) -> bool {
        match self.last_change {
            Some(last) if now.duration_since(last) >= self.config.window => {
                self.last_change = None;
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.last_change.map(|last| last + self.config.window)
    }
}

/// Handle for feeding queue notifications into the scheduler task.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    tx: mpsc::UnboundedSender<usize>,
}

impl SyncScheduler {
    pub fn spawn(
        sync: Arc<SessionSyncService>,
        config: SchedulerConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<usize>();
        let handle = tokio::spawn(async move {
            let mut debounce = Debounce::new(config);
            loop {
                let deadline = debounce.next_deadline().map(tokio::time::Instant::from_std);
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("sync scheduler shutting down");
                        break;
                    }
                    received = rx.recv() => {
                        let Some(queue_len) = received else { break };
                        if debounce.push(queue_len) == Trigger::Immediate {
                            info!(queue_len, "queue threshold reached; syncing now");
                            sync.sync(false);
                        }
                    }
                    _ = sleep_until_deadline(deadline) => {
                        if debounce.take_ready() {
                            sync.sync(false);
                        }
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Report the queue length after an enqueue.
    pub fn notify(&self, queue_len: usize) {
        let _ = self.tx.send(queue_len);
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
