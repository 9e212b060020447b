//! Trade-to-OHLCV kline aggregation
//!
//! One aggregator per (symbol, period). A trade at `ts` belongs to the
//! window `[floor(ts/period)*period, ...)`. The open candle tracks
//! open/high/low/close/volume plus a running vwap accumulator, and
//! closes on the first trade past the boundary or on a timer, whichever
//! comes first. Out-of-order trades inside the current window fold in;
//! trades older than the current window are dropped and counted.

use common::{KlineData, Px, Qty, Symbol, Ts};
use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct OpenCandle {
    open_time_ms: u64,
    open: Px,
    high: Px,
    low: Px,
    close: Px,
    volume: Qty,
    /// Running sum of price ticks x qty units; the quantity units cancel
    /// against `volume` when the vwap divides out at close
    vwap_num: i128,
    trades: u32,
}

impl OpenCandle {
    fn start(open_time_ms: u64, price: Px, qty: Qty) -> Self {
        Self {
            open_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
            vwap_num: i128::from(price.as_i64()) * i128::from(qty.as_i64()),
            trades: 1,
        }
    }

    fn fold(&mut self, price: Px, qty: Qty) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume = self.volume.add(qty);
        self.vwap_num += i128::from(price.as_i64()) * i128::from(qty.as_i64());
        self.trades += 1;
    }

    fn vwap(&self) -> Px {
        if self.volume.is_zero() {
            return self.close;
        }
        let ticks = self.vwap_num / i128::from(self.volume.as_i64());
        Px::from_i64(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    fn finish(&self, period_ms: u64) -> KlineData {
        KlineData {
            open_time: Ts::from_millis(self.open_time_ms),
            period_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap(),
            trades: self.trades,
        }
    }
}

/// Aggregates trades into candles for one (symbol, period)
#[derive(Debug)]
pub struct KlineAggregator {
    /// Symbol this aggregator serves
    pub symbol: Symbol,
    period_ms: u64,
    current: Option<OpenCandle>,
    /// Trades older than the open window, dropped
    pub late_dropped: u64,
}

impl KlineAggregator {
    /// Create an aggregator for one period
    ///
    /// # Panics
    /// Panics on a zero period.
    #[must_use]
    pub fn new(symbol: Symbol, period_ms: u64) -> Self {
        assert!(period_ms > 0, "kline period must be positive");
        Self {
            symbol,
            period_ms,
            current: None,
            late_dropped: 0,
        }
    }

    /// Window length
    #[must_use]
    pub const fn period_ms(&self) -> u64 {
        self.period_ms
    }

    const fn window_start(&self, ts: Ts) -> u64 {
        ts.as_millis() / self.period_ms * self.period_ms
    }

    /// Fold one trade; returns the closed candle when the trade opens a
    /// new window
    pub fn on_trade(&mut self, ts: Ts, price: Px, qty: Qty) -> Option<KlineData> {
        let window = self.window_start(ts);
        match &mut self.current {
            None => {
                self.current = Some(OpenCandle::start(window, price, qty));
                None
            }
            Some(candle) if window == candle.open_time_ms => {
                candle.fold(price, qty);
                None
            }
            Some(candle) if window > candle.open_time_ms => {
                let closed = candle.finish(self.period_ms);
                self.current = Some(OpenCandle::start(window, price, qty));
                Some(closed)
            }
            Some(_) => {
                // Older than the open window.
                self.late_dropped += 1;
                trace!(symbol = %self.symbol, ts = %ts, "dropped late trade");
                None
            }
        }
    }

    /// Close the open candle if `now` has passed its boundary
    pub fn on_timer(&mut self, now: Ts) -> Option<KlineData> {
        let candle = self.current.as_ref()?;
        if now.as_millis() >= candle.open_time_ms + self.period_ms {
            let closed = candle.finish(self.period_ms);
            self.current = None;
            Some(closed)
        } else {
            None
        }
    }

    /// The open (unclosed) candle, if any
    #[must_use]
    pub fn open_candle(&self) -> Option<KlineData> {
        self.current.as_ref().map(|c| c.finish(self.period_ms))
    }
}

/// Aggregators for every configured (symbol, period) pair
#[derive(Debug, Default)]
pub struct KlineService {
    aggregators: FxHashMap<(Symbol, u64), KlineAggregator>,
}

impl KlineService {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a (symbol, period) pair
    pub fn add(&mut self, symbol: Symbol, period_ms: u64) {
        self.aggregators
            .entry((symbol, period_ms))
            .or_insert_with(|| KlineAggregator::new(symbol, period_ms));
    }

    /// Fold a trade into every period for the symbol
    pub fn on_trade(&mut self, symbol: Symbol, ts: Ts, price: Px, qty: Qty) -> Vec<KlineData> {
        let mut closed = Vec::new();
        for ((sym, _), agg) in &mut self.aggregators {
            if *sym == symbol {
                if let Some(candle) = agg.on_trade(ts, price, qty) {
                    closed.push(candle);
                }
            }
        }
        closed
    }

    /// Timer sweep closing idle windows
    pub fn on_timer(&mut self, now: Ts) -> Vec<(Symbol, KlineData)> {
        self.aggregators
            .iter_mut()
            .filter_map(|((symbol, _), agg)| agg.on_timer(now).map(|c| (*symbol, c)))
            .collect()
    }

    /// Number of registered aggregators
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregators.len()
    }

    /// True when no aggregators are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }
}
