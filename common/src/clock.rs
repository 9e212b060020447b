//! Monotonic engine clock with per-venue offset calibration
//!
//! The clock anchors a monotonic `Instant` to wall time once at init, so
//! repeated `now()` calls can never step backwards even if the host clock
//! is slewed. Exchange timestamps are reconciled through per-venue offsets
//! measured from server-time probes.

use crate::types::{Ts, Venue};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Number of venues in the [`Venue`] enum
const VENUE_COUNT: usize = 4;

const fn venue_index(venue: Venue) -> usize {
    match venue {
        Venue::Binance => 0,
        Venue::Okx => 1,
        Venue::Bybit => 2,
        Venue::Coinbase => 3,
    }
}

/// Engine clock
#[derive(Debug)]
pub struct Clock {
    anchor_wall_ns: u64,
    anchor_instant: Instant,
    /// Signed offset `venue_time - local_time` per venue, nanoseconds
    offsets_ns: [AtomicI64; VENUE_COUNT],
    max_offset_ns: i64,
}

impl Clock {
    /// Create a clock anchored at the current wall time
    #[must_use]
    pub fn new(max_offset_ns: i64) -> Self {
        let anchor_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            anchor_wall_ns,
            anchor_instant: Instant::now(),
            offsets_ns: [const { AtomicI64::new(0) }; VENUE_COUNT],
            max_offset_ns,
        }
    }

    /// Current engine time, monotone non-decreasing
    #[must_use]
    pub fn now(&self) -> Ts {
        let elapsed = u64::try_from(self.anchor_instant.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Ts::from_nanos(self.anchor_wall_ns.saturating_add(elapsed))
    }

    /// Estimated current time at the venue
    #[must_use]
    pub fn venue_now(&self, venue: Venue) -> Ts {
        let offset = self.offsets_ns[venue_index(venue)].load(Ordering::Relaxed);
        let local = self.now().as_nanos() as i64;
        Ts::from_nanos(local.saturating_add(offset).max(0) as u64)
    }

    /// Current offset estimate for a venue, nanoseconds
    #[must_use]
    pub fn offset_ns(&self, venue: Venue) -> i64 {
        self.offsets_ns[venue_index(venue)].load(Ordering::Relaxed)
    }

    /// Fold one server-time probe into the venue offset
    ///
    /// `server_ts` is the venue's reported time; `rtt_ns` the measured
    /// round trip. The one-way delay is assumed symmetric. Offsets beyond
    /// the configured bound are discarded as probe noise.
    pub fn calibrate(&self, venue: Venue, server_ts: Ts, rtt_ns: u64) -> bool {
        let local_mid = self.now().as_nanos() as i64 - (rtt_ns / 2) as i64;
        let offset = server_ts.as_nanos() as i64 - local_mid;
        if offset.abs() > self.max_offset_ns {
            warn!(
                venue = %venue,
                offset_ns = offset,
                "discarding clock probe beyond max offset"
            );
            return false;
        }
        self.offsets_ns[venue_index(venue)].store(offset, Ordering::Relaxed);
        debug!(venue = %venue, offset_ns = offset, "venue clock calibrated");
        true
    }
}

static GLOBAL: OnceLock<Clock> = OnceLock::new();

/// Install the process-wide clock; called once from the engine entry point
pub fn init(max_offset_ns: i64) {
    let _ = GLOBAL.set(Clock::new(max_offset_ns));
}

/// The process-wide clock
///
/// # Panics
/// Panics when [`init`] has not run; singletons never self-initialize.
#[must_use]
pub fn global() -> &'static Clock {
    GLOBAL.get().expect("clock::init must run before use")
}

/// Convenience for `global().now()`
#[must_use]
pub fn now() -> Ts {
    global().now()
}
