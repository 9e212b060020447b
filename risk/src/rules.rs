//! Pre-trade risk rule chain
//!
//! Rules evaluate in a fixed order; the first failure rejects the order
//! with a typed error naming the rule plus observed and limit values.
//! Rule state (positions, marks, order rates, daily P&L) is fed by the
//! order dispatcher and market events. A daily-loss breach enters
//! cancel-only mode until day rollover or a manual reset.

use common::config::RiskConfig;
use common::constants::time::MILLIS_PER_DAY;
use common::{EngineError, OrderIntent, OrderType, Px, Side, Symbol, Ts};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Rolling window for the per-symbol order rate rule
const RATE_WINDOW_NS: u64 = 1_000_000_000;

#[derive(Debug, Default)]
struct DailyPnl {
    realized: i64,
    unrealized: i64,
    day_start_ms: u64,
}

/// The pre-trade risk engine
pub struct RiskEngine {
    config: RiskConfig,
    /// Signed position per symbol, quantity units
    positions: Mutex<FxHashMap<Symbol, i64>>,
    /// Latest mid per symbol
    marks: Mutex<FxHashMap<Symbol, Px>>,
    /// Order timestamps per symbol within the rate window
    rates: Mutex<FxHashMap<Symbol, VecDeque<Ts>>>,
    daily: Mutex<DailyPnl>,
    cancel_only: AtomicBool,
}

impl RiskEngine {
    /// Create an engine over the configured limits
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            positions: Mutex::new(FxHashMap::default()),
            marks: Mutex::new(FxHashMap::default()),
            rates: Mutex::new(FxHashMap::default()),
            daily: Mutex::new(DailyPnl::default()),
            cancel_only: AtomicBool::new(false),
        }
    }

    /// True when only cancels are being accepted
    #[must_use]
    pub fn is_cancel_only(&self) -> bool {
        self.cancel_only.load(Ordering::Acquire)
    }

    /// Manually clear cancel-only mode
    pub fn reset_cancel_only(&self) {
        info!("cancel-only mode manually reset");
        self.cancel_only.store(false, Ordering::Release);
    }

    /// Evaluate every rule against a new order; first failure rejects
    ///
    /// A pass also records the order against the per-symbol rate window.
    pub fn check(&self, req: &OrderIntent, now: Ts) -> Result<(), EngineError> {
        self.roll_day_if_needed(now);

        if self.is_cancel_only() {
            let daily = self.daily.lock();
            return Err(reject(
                "daily_loss",
                daily.realized + daily.unrealized,
                -self.config.daily_loss,
            ));
        }

        self.check_position_size(req)?;
        self.check_notional(req)?;
        self.check_price_deviation(req)?;
        self.check_rate(req, now)?;
        self.check_daily_loss()?;

        self.rates
            .lock()
            .entry(req.symbol)
            .or_default()
            .push_back(now);
        Ok(())
    }

    fn check_position_size(&self, req: &OrderIntent) -> Result<(), EngineError> {
        if self.config.max_position_size == i64::MAX {
            return Ok(());
        }
        let current = self
            .positions
            .lock()
            .get(&req.symbol)
            .copied()
            .unwrap_or(0);
        let projected = current + req.side.sign() * req.qty.as_i64();
        if projected.abs() > self.config.max_position_size {
            return Err(reject(
                "max_position_size",
                projected.abs(),
                self.config.max_position_size,
            ));
        }
        Ok(())
    }

    fn check_notional(&self, req: &OrderIntent) -> Result<(), EngineError> {
        if self.config.max_notional == i64::MAX {
            return Ok(());
        }
        let price = match self.effective_price(req) {
            Some(p) => p,
            None => return Ok(()), // no price reference yet
        };
        let notional = price.mul_qty(req.qty);
        if notional > self.config.max_notional {
            return Err(reject("max_notional", notional, self.config.max_notional));
        }
        Ok(())
    }

    fn check_price_deviation(&self, req: &OrderIntent) -> Result<(), EngineError> {
        let Some(price) = req.price else {
            return Ok(()); // market orders track the mid by definition
        };
        let Some(mid) = self.marks.lock().get(&req.symbol).copied() else {
            return Ok(());
        };
        if mid.as_i64() == 0 {
            return Ok(());
        }
        let deviation_bps =
            (i128::from(price.as_i64()) - i128::from(mid.as_i64())).unsigned_abs() * 10_000
                / i128::from(mid.as_i64()).unsigned_abs();
        let deviation_bps = i64::try_from(deviation_bps).unwrap_or(i64::MAX);
        if deviation_bps > self.config.price_deviation_bps {
            return Err(reject(
                "price_deviation",
                deviation_bps,
                self.config.price_deviation_bps,
            ));
        }
        Ok(())
    }

    fn check_rate(&self, req: &OrderIntent, now: Ts) -> Result<(), EngineError> {
        let mut rates = self.rates.lock();
        let window = rates.entry(req.symbol).or_default();
        while let Some(front) = window.front() {
            if now.saturating_sub(*front) > RATE_WINDOW_NS {
                window.pop_front();
            } else {
                break;
            }
        }
        let observed = window.len() as i64 + 1;
        if observed > i64::from(self.config.rate_per_symbol) {
            return Err(reject(
                "rate_per_symbol",
                observed,
                i64::from(self.config.rate_per_symbol),
            ));
        }
        Ok(())
    }

    fn check_daily_loss(&self) -> Result<(), EngineError> {
        if self.config.daily_loss == i64::MAX {
            return Ok(());
        }
        let daily = self.daily.lock();
        let total = daily.realized + daily.unrealized;
        if total < -self.config.daily_loss {
            drop(daily);
            warn!("daily loss limit breached; entering cancel-only mode");
            self.cancel_only.store(true, Ordering::Release);
            return Err(reject(
                "daily_loss",
                total,
                -self.config.daily_loss,
            ));
        }
        Ok(())
    }

    fn effective_price(&self, req: &OrderIntent) -> Option<Px> {
        match req.order_type {
            OrderType::Limit => req.price,
            OrderType::Market => self.marks.lock().get(&req.symbol).copied(),
        }
    }

    /// Update position state from a fill
    pub fn on_fill(&self, symbol: Symbol, side: Side, qty_units: i64) {
        let mut positions = self.positions.lock();
        *positions.entry(symbol).or_insert(0) += side.sign() * qty_units;
    }

    /// Update the mid mark for a symbol
    pub fn on_mark(&self, symbol: Symbol, mid: Px) {
        self.marks.lock().insert(symbol, mid);
    }

    /// Update daily P&L; `realized_delta` adds, `unrealized` replaces
    pub fn on_pnl(&self, realized_delta: i64, unrealized: i64, now: Ts) {
        self.roll_day_if_needed(now);
        let mut daily = self.daily.lock();
        daily.realized += realized_delta;
        daily.unrealized = unrealized;
    }

    fn roll_day_if_needed(&self, now: Ts) {
        let day_start = now.as_millis() / MILLIS_PER_DAY * MILLIS_PER_DAY;
        let mut daily = self.daily.lock();
        if day_start > daily.day_start_ms {
            if daily.day_start_ms != 0 {
                info!("daily risk counters rolled over");
            }
            daily.day_start_ms = day_start;
            daily.realized = 0;
            daily.unrealized = 0;
            drop(daily);
            self.cancel_only.store(false, Ordering::Release);
        }
    }
}

fn reject(rule: &str, observed: i64, limit: i64) -> EngineError {
    EngineError::RiskRejected {
        rule: rule.to_string(),
        observed,
        limit,
    }
}
