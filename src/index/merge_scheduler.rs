//! Merge schedulers.
//!
//! The writer registers merges and then hands itself to a scheduler as a
//! [`MergeSource`]. The scheduler decides which thread runs them.
//! [`SerialMergeScheduler`] uses the calling thread.
//! [`ConcurrentMergeScheduler`] feeds a bounded queue drained by a pool of
//! worker threads that grows with the backlog and shrinks when idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SegdexError};
use crate::index::merge::{MergeTrigger, OneMerge};

/// Something merges can be pulled from, i.e. the writer.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge not yet handed to a thread.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Number of registered merges waiting for a thread.
    fn pending_merge_count(&self) -> usize;

    /// Run one merge to completion. The source records the outcome.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;
}

/// Runs merges.
pub trait MergeScheduler: Send + Sync + std::fmt::Debug {
    /// Run, or arrange to run, every merge pending in `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Wait for running merges and release threads.
    fn close(&self) -> Result<()>;
}

fn run_pending(source: &dyn MergeSource) {
    while let Some(merge) = source.next_merge() {
        if let Err(e) = source.merge(&merge) {
            debug!("merge {} ended with error: {e}", merge.seg_string());
        }
    }
}

/// Runs merges one at a time on the thread that triggered them.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    running: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        let _guard = self.running.lock();
        debug!("serial merge scheduler triggered by {trigger:?}");
        run_pending(source.as_ref());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _guard = self.running.lock();
        Ok(())
    }
}

/// Configuration for [`ConcurrentMergeScheduler`].
#[derive(Debug, Clone)]
pub struct ConcurrentMergeSchedulerConfig {
    /// Capacity of the task queue; a full queue stalls the writer.
    pub max_merge_count: usize,
    /// Upper bound on worker threads.
    pub max_thread_count: usize,
    /// Workers kept alive while idle.
    pub min_thread_count: usize,
    /// Idle workers above the minimum retire after this long.
    pub idle_timeout: Duration,
}

impl Default for ConcurrentMergeSchedulerConfig {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        ConcurrentMergeSchedulerConfig {
            max_merge_count: max_thread_count + 5,
            max_thread_count,
            min_thread_count: 0,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl ConcurrentMergeSchedulerConfig {
    pub fn with_max_merge_count(mut self, value: usize) -> Self {
        self.max_merge_count = value.max(1);
        self
    }

    pub fn with_thread_counts(mut self, min: usize, max: usize) -> Self {
        self.max_thread_count = max.max(1);
        self.min_thread_count = min.min(self.max_thread_count);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_thread_count == 0 || self.max_merge_count == 0 {
            return Err(SegdexError::invalid_argument(
                "max_thread_count and max_merge_count must be at least 1",
            ));
        }
        if self.min_thread_count > self.max_thread_count {
            return Err(SegdexError::invalid_argument(format!(
                "min_thread_count {} exceeds max_thread_count {}",
                self.min_thread_count, self.max_thread_count
            )));
        }
        Ok(())
    }
}

type Task = Arc<dyn MergeSource>;

struct Workers {
    receiver: Receiver<Task>,
    config: ConcurrentMergeSchedulerConfig,
    active: AtomicUsize,
    busy: AtomicUsize,
    in_flight: Mutex<usize>,
    idle: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    fn task_done(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Retire this worker if more than the minimum are alive.
    fn try_retire(&self) -> bool {
        let mut active = self.active.load(Ordering::SeqCst);
        while active > self.config.min_thread_count {
            match self
                .active
                .compare_exchange(active, active - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => active = current,
            }
        }
        false
    }

    fn run(self: Arc<Self>) {
        loop {
            match self.receiver.recv_timeout(self.config.idle_timeout) {
                Ok(source) => {
                    self.busy.fetch_add(1, Ordering::SeqCst);
                    run_pending(source.as_ref());
                    drop(source);
                    self.busy.fetch_sub(1, Ordering::SeqCst);
                    self.task_done();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.try_retire() {
                        if self.receiver.is_empty() {
                            debug!("idle merge thread retiring");
                            return;
                        }
                        // A task arrived while retiring.
                        self.active.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

/// Runs merges on a dynamically sized pool of background threads.
pub struct ConcurrentMergeScheduler {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Arc<Workers>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("config", &self.workers.config)
            .field("active_threads", &self.active_thread_count())
            .finish()
    }
}

impl ConcurrentMergeScheduler {
    pub fn new(config: ConcurrentMergeSchedulerConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = bounded(config.max_merge_count);
        Ok(ConcurrentMergeScheduler {
            sender: Mutex::new(Some(sender)),
            workers: Arc::new(Workers {
                receiver,
                config,
                active: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Worker threads currently alive.
    pub fn active_thread_count(&self) -> usize {
        self.workers.active.load(Ordering::SeqCst)
    }

    /// Tasks queued but not yet picked up.
    pub fn queued_count(&self) -> usize {
        self.workers.receiver.len()
    }

    /// Spawn a worker if the backlog, plus `incoming` tasks about to be
    /// queued, exceeds the idle workers.
    fn maybe_spawn(&self, incoming: usize) -> Result<()> {
        let workers = &self.workers;
        let active = workers.active.load(Ordering::SeqCst);
        let idle = active.saturating_sub(workers.busy.load(Ordering::SeqCst));
        let backlog = workers.receiver.len() + incoming;
        if backlog == 0 {
            return Ok(());
        }
        let wanted = active < workers.config.min_thread_count || backlog > idle;
        if !wanted || active >= workers.config.max_thread_count {
            return Ok(());
        }

        workers.active.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(workers);
        let spawned = thread::Builder::new()
            .name(format!("segdex-merge-{active}"))
            .spawn(move || pool.run());
        match spawned {
            Ok(handle) => {
                let mut handles = workers.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                debug!("started merge thread, {} active", active + 1);
                Ok(())
            }
            Err(e) => {
                workers.active.fetch_sub(1, Ordering::SeqCst);
                Err(SegdexError::Io(e))
            }
        }
    }

    fn enqueue(&self, mut task: Task) -> Result<()> {
        let Some(sender) = self.sender.lock().clone() else {
            return Err(SegdexError::already_closed("merge scheduler is closed"));
        };
        *self.workers.in_flight.lock() += 1;
        loop {
            if let Err(e) = self.maybe_spawn(1) {
                self.workers.task_done();
                return Err(e);
            }
            // Blocks while the queue is full; retried so a worker that retired
            // meanwhile is replaced.
            match sender.send_timeout(task, Duration::from_millis(50)) {
                Ok(()) => return self.maybe_spawn(0),
                Err(SendTimeoutError::Timeout(t)) => task = t,
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.workers.task_done();
                    return Err(SegdexError::already_closed("merge scheduler is closed"));
                }
            }
        }
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pending = source.pending_merge_count();
        if pending == 0 {
            return Ok(());
        }
        debug!("{pending} merges pending after {trigger:?}");
        let tasks = pending
            .min(self.workers.config.max_thread_count)
            .saturating_sub(self.queued_count())
            .max(1);
        for _ in 0..tasks {
            self.enqueue(Arc::clone(&source))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut in_flight = self.workers.in_flight.lock();
            while *in_flight > 0 {
                self.workers.idle.wait(&mut in_flight);
            }
        }
        self.sender.lock().take();

        let handles: Vec<_> = self.workers.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("merge thread panicked");
                return Err(SegdexError::ThreadJoinError(
                    "merge thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for ConcurrentMergeScheduler {
    fn drop(&mut self) {
        // Disconnect the queue so idle workers exit.
        self.sender.lock().take();
    }
}

/// Which scheduler a writer uses.
#[derive(Debug, Clone)]
pub enum MergeSchedulerConfig {
    Serial,
    Concurrent(ConcurrentMergeSchedulerConfig),
}

impl Default for MergeSchedulerConfig {
    fn default() -> Self {
        MergeSchedulerConfig::Concurrent(ConcurrentMergeSchedulerConfig::default())
    }
}

impl MergeSchedulerConfig {
    /// Instantiate the configured scheduler.
    pub fn build(&self) -> Result<Arc<dyn MergeScheduler>> {
        match self {
            MergeSchedulerConfig::Serial => Ok(Arc::new(SerialMergeScheduler::new())),
            MergeSchedulerConfig::Concurrent(config) => {
                Ok(Arc::new(ConcurrentMergeScheduler::new(config.clone())?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use super::*;
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};

    struct FakeSource {
        pending: Mutex<Vec<Arc<OneMerge>>>,
        done: AtomicU32,
        running: AtomicUsize,
        max_running: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new(count: usize, delay: Duration) -> Arc<Self> {
            let pending = (0..count)
                .map(|i| {
                    let info = SegmentInfo::new(format!("_{i}"), 1, "Segdex10", BTreeSet::new(), 1, "flush", 0);
                    Arc::new(OneMerge::new(vec![SegmentCommitInfo::new(info)]))
                })
                .collect();
            Arc::new(FakeSource {
                pending: Mutex::new(pending),
                done: AtomicU32::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl MergeSource for FakeSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            self.pending.lock().pop()
        }

        fn pending_merge_count(&self) -> usize {
            self.pending.lock().len()
        }

        fn merge(&self, _merge: &Arc<OneMerge>) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_serial_runs_everything_inline() {
        let source = FakeSource::new(4, Duration::ZERO);
        let scheduler = SerialMergeScheduler::new();
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        assert_eq!(source.done.load(Ordering::SeqCst), 4);
        assert_eq!(source.max_running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_bounds_threads_and_drains() {
        let source = FakeSource::new(8, Duration::from_millis(20));
        let config = ConcurrentMergeSchedulerConfig::default()
            .with_thread_counts(0, 3)
            .with_max_merge_count(2);
        let scheduler = ConcurrentMergeScheduler::new(config).unwrap();
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        assert!(scheduler.active_thread_count() <= 3);

        scheduler.close().unwrap();
        assert_eq!(source.done.load(Ordering::SeqCst), 8);
        assert!(source.max_running.load(Ordering::SeqCst) <= 3);
        assert!(source.max_running.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_idle_workers_retire() {
        let source = FakeSource::new(2, Duration::ZERO);
        let config = ConcurrentMergeSchedulerConfig::default()
            .with_thread_counts(0, 2)
            .with_idle_timeout(Duration::from_millis(20));
        let scheduler = ConcurrentMergeScheduler::new(config).unwrap();
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.active_thread_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(scheduler.active_thread_count(), 0);
        assert_eq!(source.done.load(Ordering::SeqCst), 2);
        scheduler.close().unwrap();
    }

    #[test]
    fn test_closed_scheduler_ignores_new_work() {
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig::default()).unwrap();
        scheduler.close().unwrap();
        let source = FakeSource::new(1, Duration::ZERO);
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        assert_eq!(source.pending_merge_count(), 1);
    }

    #[test]
    fn test_config_validation() {
        let config = ConcurrentMergeSchedulerConfig {
            min_thread_count: 3,
            max_thread_count: 2,
            ..Default::default()
        };
        assert!(ConcurrentMergeScheduler::new(config).is_err());
    }
}
