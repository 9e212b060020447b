//! Prioritized event dispatcher
//!
//! One dispatcher per hot path (market, orders). Four priority classes
//! drain with per-tick quotas so lower classes cannot starve: Critical is
//! drained fully, then at most `high_quota` High items, then one Normal
//! batch, then one Low batch, each class admitting at least one item per
//! tick when non-empty. Delayed work comes from the timer wheel. Parking
//! on empty queues uses a condvar bounded by the next timer deadline.

use crate::queue::MpmcQueue;
use crate::timer::{TimerHandle, TimerWheel};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Order-path completions, circuit trips
    Critical,
    /// Market events on the hot path
    High,
    /// Strategy ticks, aggregation
    Normal,
    /// Housekeeping, metrics
    Low,
}

const CLASSES: usize = 4;

const fn class_index(p: Priority) -> usize {
    match p {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

/// A unit of work posted to the dispatcher
pub struct Task {
    cancelled: Option<Arc<AtomicBool>>,
    run: Box<dyn FnOnce() + Send + 'static>,
}

/// Cancellation token for a posted task
///
/// Cancellation is cooperative: the flag is checked before execution; a
/// task already running is never preempted.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Request that the task be skipped
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True when cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Tuning knobs for one dispatcher
#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    /// Max High items per tick
    pub high_quota: usize,
    /// Normal batch size per tick
    pub normal_batch: usize,
    /// Low batch size per tick
    pub low_batch: usize,
    /// Longest park when no timers are pending
    pub idle_park: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            high_quota: 64,
            normal_batch: 16,
            low_batch: 4,
            idle_park: Duration::from_millis(10),
        }
    }
}

struct Shared {
    queues: [MpmcQueue<Task>; CLASSES],
    running: AtomicBool,
    parker: Mutex<bool>,
    unparker: Condvar,
    timers: Mutex<TimerWheel>,
}

/// Handle used by producers to post work and schedule timers
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    /// Post a task at a priority
    pub fn post<F: FnOnce() + Send + 'static>(&self, priority: Priority, f: F) {
        self.shared.queues[class_index(priority)].push(Task {
            cancelled: None,
            run: Box::new(f),
        });
        self.unpark();
    }

    /// Post a cancellable task at a priority
    pub fn post_cancellable<F: FnOnce() + Send + 'static>(
        &self,
        priority: Priority,
        f: F,
    ) -> CancelToken {
        let flag = Arc::new(AtomicBool::new(false));
        self.shared.queues[class_index(priority)].push(Task {
            cancelled: Some(Arc::clone(&flag)),
            run: Box::new(f),
        });
        self.unpark();
        CancelToken { flag }
    }

    /// Schedule a callback on this dispatcher after `delay`
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) -> TimerHandle {
        let handle = self.shared.timers.lock().schedule(delay, Box::new(f));
        self.unpark();
        handle
    }

    /// Request the dispatcher to stop after the current tick
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.unpark();
    }

    /// Total queued tasks across classes (approximate)
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.shared.queues.iter().map(MpmcQueue::len).sum()
    }

    fn unpark(&self) {
        let mut woken = self.shared.parker.lock();
        *woken = true;
        self.shared.unparker.notify_one();
    }
}

/// The dispatcher loop; `run` consumes the thread it is called on
pub struct EventLoop {
    shared: Arc<Shared>,
    config: EventLoopConfig,
    name: &'static str,
}

impl EventLoop {
    /// Create a dispatcher and its producer handle
    #[must_use]
    pub fn new(name: &'static str, config: EventLoopConfig) -> (Self, EventLoopHandle) {
        let shared = Arc::new(Shared {
            queues: [
                MpmcQueue::new(),
                MpmcQueue::new(),
                MpmcQueue::new(),
                MpmcQueue::new(),
            ],
            running: AtomicBool::new(true),
            parker: Mutex::new(false),
            unparker: Condvar::new(),
            timers: Mutex::new(TimerWheel::new()),
        });
        let handle = EventLoopHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                config,
                name,
            },
            handle,
        )
    }

    /// Run until shutdown; executes tasks and fires timers inline
    pub fn run(self) {
        debug!(dispatcher = self.name, "dispatcher started");
        let epoch = Instant::now();
        while self.shared.running.load(Ordering::Acquire) {
            let mut did_work = false;

            // Critical: drain fully.
            while let Some(task) = self.shared.queues[0].pop() {
                Self::execute(task);
                did_work = true;
            }

            // High: bounded quota, at least one when non-empty.
            for _ in 0..self.config.high_quota.max(1) {
                match self.shared.queues[1].pop() {
                    Some(task) => {
                        Self::execute(task);
                        did_work = true;
                    }
                    None => break,
                }
            }

            // Normal and Low: one batch each.
            for (idx, batch) in [
                (2_usize, self.config.normal_batch.max(1)),
                (3_usize, self.config.low_batch.max(1)),
            ] {
                for _ in 0..batch {
                    match self.shared.queues[idx].pop() {
                        Some(task) => {
                            Self::execute(task);
                            did_work = true;
                        }
                        None => break,
                    }
                }
            }

            // Drive the wheel to wall-clock time.
            let now_ticks = epoch.elapsed().as_millis() as u64;
            {
                let mut timers = self.shared.timers.lock();
                if timers.now_ticks() < now_ticks {
                    timers.advance(now_ticks);
                }
            }

            if !did_work {
                self.park();
            }
        }

        // Release queued tasks and timer entries so closures holding
        // handles back into this loop cannot keep it alive.
        for queue in &self.shared.queues {
            while queue.pop().is_some() {}
        }
        *self.shared.timers.lock() = TimerWheel::new();
        debug!(dispatcher = self.name, "dispatcher stopped");
    }

    fn execute(task: Task) {
        if let Some(flag) = &task.cancelled {
            if flag.load(Ordering::Acquire) {
                return;
            }
        }
        (task.run)();
    }

    fn park(&self) {
        let wait = {
            let timers = self.shared.timers.lock();
            timers
                .next_deadline_hint()
                .map_or(self.config.idle_park, Duration::from_millis)
                .min(self.config.idle_park)
        };
        let mut woken = self.shared.parker.lock();
        if !*woken {
            let _ = self
                .shared
                .unparker
                .wait_for(&mut woken, wait);
        }
        *woken = false;
    }

    /// Spawn the dispatcher on a dedicated named thread
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        let name = self.name;
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .unwrap_or_else(|e| {
                error!(dispatcher = name, error = %e, "failed to spawn dispatcher");
                panic!("dispatcher spawn failed: {e}");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    fn start(config: EventLoopConfig) -> (EventLoopHandle, std::thread::JoinHandle<()>) {
        let (ev, handle) = EventLoop::new("test-loop", config);
        let join = ev.spawn();
        (handle, join)
    }

    #[test]
    fn executes_posted_tasks() {
        let (handle, join) = start(EventLoopConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            handle.post(Priority::Normal, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        while counter.load(Ordering::SeqCst) < 100 {
            std::thread::yield_now();
        }
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn critical_preempts_lower_classes() {
        let (ev, handle) = EventLoop::new("prio-loop", EventLoopConfig::default());
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Enqueue before the loop runs so one tick observes all classes.
        for (prio, tag) in [
            (Priority::Low, "low"),
            (Priority::Normal, "normal"),
            (Priority::High, "high"),
            (Priority::Critical, "critical"),
        ] {
            let order = Arc::clone(&order);
            handle.post(prio, move || order.lock().unwrap().push(tag));
        }

        let join = ev.spawn();
        loop {
            if order.lock().unwrap().len() == 4 {
                break;
            }
            std::thread::yield_now();
        }
        handle.shutdown();
        join.join().unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high", "normal", "low"]
        );
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let (ev, handle) = EventLoop::new("cancel-loop", EventLoopConfig::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let token = handle.post_cancellable(Priority::Normal, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        handle.post(Priority::Normal, move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let join = ev.spawn();
        while done.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        handle.shutdown();
        join.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timer_fires_on_dispatcher() {
        let (handle, join) = start(EventLoopConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        handle.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "timer never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn lower_classes_make_progress_under_high_load() {
        let (handle, join) = start(EventLoopConfig {
            high_quota: 4,
            normal_batch: 1,
            low_batch: 1,
            idle_park: Duration::from_millis(1),
        });
        let low_ran = Arc::new(AtomicUsize::new(0));

        // Keep the High queue saturated for a while.
        for _ in 0..500 {
            handle.post(Priority::High, || {});
        }
        let l = Arc::clone(&low_ran);
        handle.post(Priority::Low, move || {
            l.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while low_ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "low class starved");
            std::thread::yield_now();
        }
        handle.shutdown();
        join.join().unwrap();
    }
}
