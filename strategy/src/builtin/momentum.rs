//! Momentum (ROC + RSI) template
//!
//! Rate-of-change over a lookback gated by RSI so entries avoid
//! already-stretched conditions. One entry per direction change.

use crate::{Signal, Strategy};
use arc_swap::ArcSwap;
use common::{MarketEvent, MarketPayload, OrderType, Qty, Side, Symbol, TimeInForce};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Params {
    lookback: usize,
    rsi_period: usize,
    roc_threshold: f64,
    rsi_overbought: f64,
    rsi_oversold: f64,
    qty: Qty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParams {
    lookback: usize,
    rsi_period: usize,
    roc_threshold: f64,
    rsi_overbought: f64,
    rsi_oversold: f64,
    qty: String,
}

impl Default for RawParams {
    fn default() -> Self {
        Self {
            lookback: 20,
            rsi_period: 14,
            roc_threshold: 0.01,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            qty: "0.001".to_string(),
        }
    }
}

impl RawParams {
    fn parse(self) -> anyhow::Result<Params> {
        anyhow::ensure!(self.lookback >= 2 && self.rsi_period >= 2, "periods too small");
        anyhow::ensure!(self.roc_threshold > 0.0, "roc threshold must be positive");
        Ok(Params {
            lookback: self.lookback,
            rsi_period: self.rsi_period,
            roc_threshold: self.roc_threshold,
            rsi_overbought: self.rsi_overbought,
            rsi_oversold: self.rsi_oversold,
            qty: Qty::parse(&self.qty).map_err(|e| anyhow::anyhow!("qty: {e}"))?,
        })
    }
}

/// The template
pub struct Momentum {
    id: String,
    symbol: Symbol,
    params: ArcSwap<Params>,
    prices: VecDeque<f64>,
    last_direction: i8,
    pending: Vec<Signal>,
}

impl Momentum {
    /// Build from a JSON parameter object
    pub fn new(id: &str, symbol: Symbol, params: &serde_json::Value) -> anyhow::Result<Self> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        Ok(Self {
            id: id.to_string(),
            symbol,
            params: ArcSwap::from_pointee(raw.parse()?),
            prices: VecDeque::new(),
            last_direction: 0,
            pending: Vec::new(),
        })
    }

    fn roc(&self, lookback: usize) -> Option<f64> {
        let n = self.prices.len();
        if n <= lookback {
            return None;
        }
        let old = self.prices[n - 1 - lookback];
        let last = *self.prices.back()?;
        if old <= f64::EPSILON {
            return None;
        }
        Some((last - old) / old)
    }

    fn rsi(&self, period: usize) -> Option<f64> {
        let n = self.prices.len();
        if n <= period {
            return None;
        }
        let mut gains = 0.0;
        let mut losses = 0.0;
        for i in (n - period)..n {
            let delta = self.prices[i] - self.prices[i - 1];
            if delta > 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        if losses <= f64::EPSILON {
            return Some(100.0);
        }
        let rs = gains / losses;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

impl Strategy for Momentum {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.last_direction = 0;
        self.pending.clear();
    }

    fn on_market_event(&mut self, event: &MarketEvent) -> anyhow::Result<()> {
        if event.symbol != self.symbol {
            return Ok(());
        }
        let MarketPayload::Trade(trade) = &event.payload else {
            return Ok(());
        };
        let params = self.params.load();

        self.prices.push_back(trade.price.as_f64());
        let cap = params.lookback.max(params.rsi_period) + 2;
        if self.prices.len() > cap {
            self.prices.pop_front();
        }

        let (Some(roc), Some(rsi)) = (self.roc(params.lookback), self.rsi(params.rsi_period))
        else {
            return Ok(());
        };

        let direction = if roc > params.roc_threshold && rsi < params.rsi_overbought {
            1
        } else if roc < -params.roc_threshold && rsi > params.rsi_oversold {
            -1
        } else {
            0
        };

        if direction != 0 && direction != self.last_direction {
            self.pending.push(Signal {
                symbol: self.symbol,
                side: if direction > 0 { Side::Buy } else { Side::Sell },
                order_type: OrderType::Market,
                price: None,
                qty: params.qty,
                tif: TimeInForce::Ioc,
            });
        }
        if direction != 0 {
            self.last_direction = direction;
        }
        Ok(())
    }

    fn get_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.pending)
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        self.params.store(Arc::new(raw.parse()?));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Px, TradeEvent, Ts, Venue};

    fn trade(symbol: Symbol, price: f64, seq: u64) -> MarketEvent {
        MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq,
            ts_exchange: Ts::from_nanos(seq),
            ts_recv: Ts::from_nanos(seq),
            payload: MarketPayload::Trade(TradeEvent {
                price: Px::parse(&format!("{price:.2}")).unwrap(),
                qty: Qty::parse("1").unwrap(),
                side: Side::Buy,
            }),
        }
    }

    #[test]
    fn sustained_rally_triggers_one_buy() {
        let sym = Symbol::new(1);
        let params = serde_json::json!({
            "lookback": 5, "rsi_period": 5, "roc_threshold": 0.02,
            "rsi_overbought": 95.0, "rsi_oversold": 5.0, "qty": "1"
        });
        let mut s = Momentum::new("mom1", sym, &params).unwrap();

        let mut seq = 0;
        let mut price = 100.0;
        let mut buys = 0;
        for i in 0..30 {
            seq += 1;
            // Rising with small dips so RSI stays below the gate.
            price += if i % 4 == 3 { -0.2 } else { 1.0 };
            s.on_market_event(&trade(sym, price, seq)).unwrap();
            for signal in s.get_signals() {
                assert_eq!(signal.side, Side::Buy);
                buys += 1;
            }
        }
        assert_eq!(buys, 1, "one entry per direction");
    }

    #[test]
    fn flat_tape_stays_quiet() {
        let sym = Symbol::new(1);
        let mut s = Momentum::new("mom1", sym, &serde_json::json!({})).unwrap();
        for seq in 1..100 {
            s.on_market_event(&trade(sym, 100.0, seq)).unwrap();
        }
        assert!(s.get_signals().is_empty());
    }
}
