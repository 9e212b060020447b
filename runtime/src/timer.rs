//! Hierarchical timer wheel
//!
//! Four cascading wheels of 256 slots each at resolutions of 1ms, 256ms,
//! ~65s and ~4.7h, covering delays up to ~49 days. Scheduling is O(1);
//! firing is O(entries due). Entries resident in an upper wheel cascade
//! down as their slot comes due, so a callback fires no later than one
//! slot of its resident wheel past the deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Slots per wheel level
const SLOTS: usize = 256;
/// Number of wheel levels
const LEVELS: usize = 4;

/// Callback type fired by the wheel on the owning dispatcher
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation handle returned by [`TimerWheel::schedule`]
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Request cancellation; a timer already firing is not preempted
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True when cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    deadline_ticks: u64,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

/// The wheel itself; owned and driven by a single dispatcher
pub struct TimerWheel {
    wheels: Vec<Vec<Vec<TimerEntry>>>,
    /// Current time in 1ms ticks since wheel creation
    now_ticks: u64,
    pending: usize,
}

impl TimerWheel {
    /// Per-level resolution in ticks: 1, 256, 256^2, 256^3
    const fn level_resolution(level: usize) -> u64 {
        1 << (8 * level as u64)
    }

    /// Create an empty wheel starting at tick zero
    #[must_use]
    pub fn new() -> Self {
        let wheels = (0..LEVELS)
            .map(|_| (0..SLOTS).map(|_| Vec::new()).collect())
            .collect();
        Self {
            wheels,
            now_ticks: 0,
            pending: 0,
        }
    }

    /// Number of scheduled, unfired entries (including cancelled ones)
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    /// Current wheel time in ticks
    #[must_use]
    pub const fn now_ticks(&self) -> u64 {
        self.now_ticks
    }

    /// Schedule `callback` to fire after `delay`
    ///
    /// Delays round up to at least one tick so a zero delay still passes
    /// through one `advance` call.
    pub fn schedule(&mut self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let delay_ticks = (delay.as_millis() as u64).max(1);
        let deadline_ticks = self.now_ticks + delay_ticks;
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline_ticks,
            cancelled: Arc::clone(&cancelled),
            callback,
        };
        self.insert(entry);
        self.pending += 1;
        TimerHandle { cancelled }
    }

    /// Compute (level, slot) for a deadline and insert
    fn insert(&mut self, entry: TimerEntry) {
        let delta = entry.deadline_ticks.saturating_sub(self.now_ticks);
        let level = match delta {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            0x1_0000..=0xFF_FFFF => 2,
            _ => 3,
        };
        let resolution = Self::level_resolution(level);
        let slot = ((entry.deadline_ticks / resolution) % SLOTS as u64) as usize;
        self.wheels[level][slot].push(entry);
    }

    /// Advance the wheel to `to_ticks`, firing everything due
    ///
    /// Fired callbacks run inline on the caller (the owning dispatcher).
    pub fn advance(&mut self, to_ticks: u64) {
        while self.now_ticks < to_ticks {
            self.now_ticks += 1;
            self.tick();
        }
    }

    fn tick(&mut self) {
        let now = self.now_ticks;

        // Cascade upper levels whose slot boundary we just crossed.
        for level in (1..LEVELS).rev() {
            let resolution = Self::level_resolution(level);
            if now % resolution == 0 {
                let slot = ((now / resolution) % SLOTS as u64) as usize;
                let entries = std::mem::take(&mut self.wheels[level][slot]);
                for entry in entries {
                    self.pending -= 1;
                    self.reinsert_or_fire(entry);
                }
            }
        }

        // Fire the level-0 slot for this tick.
        let slot = (now % SLOTS as u64) as usize;
        let due: Vec<TimerEntry> = {
            let bucket = &mut self.wheels[0][slot];
            let mut due = Vec::new();
            let mut keep = Vec::new();
            for entry in bucket.drain(..) {
                if entry.deadline_ticks <= now {
                    due.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            *bucket = keep;
            due
        };
        for entry in due {
            self.pending -= 1;
            Self::fire(entry);
        }
    }

    fn reinsert_or_fire(&mut self, entry: TimerEntry) {
        if entry.deadline_ticks <= self.now_ticks {
            Self::fire(entry);
        } else {
            self.insert(entry);
            self.pending += 1;
        }
    }

    fn fire(entry: TimerEntry) {
        if !entry.cancelled.load(Ordering::Acquire) {
            (entry.callback)();
        }
    }

    /// Ticks until the next scheduled deadline, if any
    ///
    /// Conservative: reports the next non-empty level-0 slot within one
    /// rotation, else the coarse distance to the next upper-level cascade.
    #[must_use]
    pub fn next_deadline_hint(&self) -> Option<u64> {
        if self.pending == 0 {
            return None;
        }
        for ahead in 1..=SLOTS as u64 {
            let t = self.now_ticks + ahead;
            let slot = (t % SLOTS as u64) as usize;
            if self.wheels[0][slot]
                .iter()
                .any(|e| e.deadline_ticks <= t)
            {
                return Some(ahead);
            }
        }
        Some(SLOTS as u64)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
