//! Per-venue circuit breaker
//!
//! Two trip signals: consecutive adapter errors and realized-loss delta
//! within a rolling window. Closed → Open on either threshold; after the
//! cooldown one probe order may pass (HalfOpen); probe success closes
//! the breaker, probe failure re-opens it with an extended cooldown.

use common::Venue;
use common::config::CircuitConfig;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Loss accumulation window
const LOSS_WINDOW: Duration = Duration::from_secs(60);

/// Breaker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// One probe allowed through
    HalfOpen,
}

/// Outcome of asking the breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally
    Proceed,
    /// Proceed as the cooldown probe; report the outcome
    Probe,
    /// Fail fast
    Reject,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_errors: u64,
    loss_in_window: i64,
    window_start: Instant,
    opened_at: Instant,
    /// Consecutive opens; extends the cooldown exponentially
    open_streak: u32,
    probe_in_flight: bool,
}

/// Circuit breaker for one venue
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_errors: 0,
                loss_in_window: 0,
                window_start: now,
                opened_at: now,
                open_streak: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state (cooldown transitions applied)
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Ask to send an order
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Admission::Proceed,
            BreakerState::Open => Admission::Reject,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Reject
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Report a successful adapter call
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_errors = 0;
        if inner.state == BreakerState::HalfOpen {
            info!("circuit probe succeeded; closing breaker");
            inner.state = BreakerState::Closed;
            inner.open_streak = 0;
        }
        inner.probe_in_flight = false;
    }

    /// Report a failed adapter call
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_errors += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("circuit probe failed; re-opening breaker");
                Self::open(&mut inner);
            }
            BreakerState::Closed if inner.consecutive_errors >= self.config.error_threshold => {
                warn!(
                    errors = inner.consecutive_errors,
                    "error threshold exceeded; opening breaker"
                );
                Self::open(&mut inner);
            }
            _ => {}
        }
        inner.probe_in_flight = false;
    }

    /// Report realized loss (positive = loss) attributed to the venue
    pub fn on_loss(&self, loss: i64) {
        let mut inner = self.inner.lock();
        if inner.window_start.elapsed() > LOSS_WINDOW {
            inner.loss_in_window = 0;
            inner.window_start = Instant::now();
        }
        inner.loss_in_window += loss;
        if inner.state == BreakerState::Closed
            && self.config.loss_threshold != i64::MAX
            && inner.loss_in_window >= self.config.loss_threshold
        {
            warn!(
                loss = inner.loss_in_window,
                "loss threshold exceeded; opening breaker"
            );
            Self::open(&mut inner);
        }
    }

    fn open(inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Instant::now();
        inner.open_streak = inner.open_streak.saturating_add(1);
        inner.consecutive_errors = 0;
        inner.probe_in_flight = false;
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let cooldown = self.cooldown_for(inner.open_streak);
            if inner.opened_at.elapsed() >= cooldown {
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = false;
            }
        }
    }

    fn cooldown_for(&self, streak: u32) -> Duration {
        let factor = 1_u64 << streak.saturating_sub(1).min(8);
        Duration::from_millis(self.config.cooldown_ms.saturating_mul(factor))
    }
}

/// Breakers for all configured venues
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: FxHashMap<Venue, CircuitBreaker>,
}

impl BreakerRegistry {
    /// Build breakers for `venues` from one shared config
    #[must_use]
    pub fn new(config: &CircuitConfig, venues: impl IntoIterator<Item = Venue>) -> Self {
        let breakers = venues
            .into_iter()
            .map(|v| (v, CircuitBreaker::new(config.clone())))
            .collect();
        Self { breakers }
    }

    /// Breaker for a venue, if configured
    #[must_use]
    pub fn get(&self, venue: Venue) -> Option<&CircuitBreaker> {
        self.breakers.get(&venue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cooldown_ms: u64) -> CircuitConfig {
        CircuitConfig {
            error_threshold: 3,
            loss_threshold: 1_000,
            cooldown_ms,
        }
    }

    #[test]
    fn opens_after_consecutive_errors() {
        let cb = CircuitBreaker::new(config(60_000));
        assert_eq!(cb.admit(), Admission::Proceed);
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.admit(), Admission::Reject);
    }

    #[test]
    fn success_resets_error_streak() {
        let cb = CircuitBreaker::new(config(60_000));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_then_close() {
        let cb = CircuitBreaker::new(config(10));
        for _ in 0..3 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.admit(), Admission::Probe);
        // Only one probe at a time.
        assert_eq!(cb.admit(), Admission::Reject);

        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.admit(), Admission::Proceed);
    }

    #[test]
    fn failed_probe_extends_cooldown() {
        let cb = CircuitBreaker::new(config(20));
        for _ in 0..3 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.admit(), Admission::Probe);
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // First cooldown was 20ms; after a failed probe it doubles.
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.admit(), Admission::Probe);
    }

    #[test]
    fn loss_threshold_opens() {
        let cb = CircuitBreaker::new(config(60_000));
        cb.on_loss(400);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.on_loss(700);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn registry_is_per_venue() {
        let reg = BreakerRegistry::new(&config(60_000), [Venue::Binance, Venue::Okx]);
        for _ in 0..3 {
            reg.get(Venue::Binance).unwrap().on_failure();
        }
        assert_eq!(reg.get(Venue::Binance).unwrap().state(), BreakerState::Open);
        assert_eq!(reg.get(Venue::Okx).unwrap().state(), BreakerState::Closed);
        assert!(reg.get(Venue::Coinbase).is_none());
    }
}
