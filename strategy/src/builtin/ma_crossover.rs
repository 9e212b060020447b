//! Moving-average crossover template
//!
//! Fast SMA crossing above the slow SMA signals a buy; crossing below
//! signals a sell. One position flip per cross.

use crate::{Signal, Strategy};
use arc_swap::ArcSwap;
use common::{MarketEvent, MarketPayload, OrderType, Px, Qty, Side, Symbol, TimeInForce};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Params {
    fast: usize,
    slow: usize,
    qty: Qty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParams {
    fast: usize,
    slow: usize,
    qty: String,
}

impl Default for RawParams {
    fn default() -> Self {
        Self {
            fast: 10,
            slow: 30,
            qty: "0.001".to_string(),
        }
    }
}

impl RawParams {
    fn parse(self) -> anyhow::Result<Params> {
        anyhow::ensure!(self.fast > 0 && self.slow > self.fast, "need slow > fast > 0");
        Ok(Params {
            fast: self.fast,
            slow: self.slow,
            qty: Qty::parse(&self.qty).map_err(|e| anyhow::anyhow!("qty: {e}"))?,
        })
    }
}

/// The template
pub struct MaCrossover {
    id: String,
    symbol: Symbol,
    params: ArcSwap<Params>,
    prices: VecDeque<f64>,
    last_price: Option<Px>,
    /// Sign of (fast - slow) on the previous tick
    last_diff_sign: Option<i8>,
    pending: Vec<Signal>,
}

impl MaCrossover {
    /// Build from a JSON parameter object
    pub fn new(id: &str, symbol: Symbol, params: &serde_json::Value) -> anyhow::Result<Self> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        Ok(Self {
            id: id.to_string(),
            symbol,
            params: ArcSwap::from_pointee(raw.parse()?),
            prices: VecDeque::new(),
            last_price: None,
            last_diff_sign: None,
            pending: Vec::new(),
        })
    }

    fn sma(&self, n: usize) -> Option<f64> {
        if self.prices.len() < n {
            return None;
        }
        Some(self.prices.iter().rev().take(n).sum::<f64>() / n as f64)
    }
}

impl Strategy for MaCrossover {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.last_price = None;
        self.last_diff_sign = None;
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
        if self.prices.len() > params.slow {
            self.prices.pop_front();
        }
        self.last_price = Some(trade.price);

        let (Some(fast), Some(slow)) = (self.sma(params.fast), self.sma(params.slow)) else {
            return Ok(());
        };
        let sign = if fast > slow { 1_i8 } else { -1_i8 };
        if let Some(prev) = self.last_diff_sign {
            if prev != sign {
                let side = if sign > 0 { Side::Buy } else { Side::Sell };
                self.pending.push(Signal {
                    symbol: self.symbol,
                    side,
                    order_type: OrderType::Limit,
                    price: Some(trade.price),
                    qty: params.qty,
                    tif: TimeInForce::Gtc,
                });
            }
        }
        self.last_diff_sign = Some(sign);
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

    fn trade(symbol: Symbol, price: &str, seq: u64) -> MarketEvent {
        MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq,
            ts_exchange: Ts::from_nanos(seq),
            ts_recv: Ts::from_nanos(seq),
            payload: MarketPayload::Trade(TradeEvent {
                price: Px::parse(price).unwrap(),
                qty: Qty::parse("1").unwrap(),
                side: Side::Buy,
            }),
        }
    }

    fn params(fast: usize, slow: usize) -> serde_json::Value {
        serde_json::json!({"fast": fast, "slow": slow, "qty": "0.5"})
    }

    #[test]
    fn upward_cross_emits_buy() {
        let sym = Symbol::new(1);
        let mut s = MaCrossover::new("ma1", sym, &params(2, 4)).unwrap();

        // Establish fast below slow, then rally through it.
        let mut seq = 0;
        for p in ["100", "99", "98", "97", "97", "97"] {
            seq += 1;
            s.on_market_event(&trade(sym, p, seq)).unwrap();
        }
        assert!(s.get_signals().is_empty());
        for p in ["105", "112", "120"] {
            seq += 1;
            s.on_market_event(&trade(sym, p, seq)).unwrap();
        }
        let signals = s.get_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert_eq!(signals[0].qty, Qty::parse("0.5").unwrap());
    }

    #[test]
    fn ignores_other_symbols() {
        let mut s = MaCrossover::new("ma1", Symbol::new(1), &params(2, 3)).unwrap();
        for seq in 1..20 {
            s.on_market_event(&trade(Symbol::new(2), "100", seq)).unwrap();
        }
        assert!(s.get_signals().is_empty());
    }

    #[test]
    fn hot_reload_swaps_qty() {
        let sym = Symbol::new(1);
        let mut s = MaCrossover::new("ma1", sym, &params(2, 4)).unwrap();
        s.update_params(&serde_json::json!({"fast": 2, "slow": 4, "qty": "2"}))
            .unwrap();
        let mut seq = 0;
        for p in ["100", "99", "98", "97", "110", "120", "130"] {
            seq += 1;
            s.on_market_event(&trade(sym, p, seq)).unwrap();
        }
        let signals = s.get_signals();
        assert!(!signals.is_empty());
        assert_eq!(signals[0].qty, Qty::parse("2").unwrap());
    }

    #[test]
    fn bad_params_rejected() {
        assert!(MaCrossover::new("x", Symbol::new(1), &params(5, 2)).is_err());
        let mut s = MaCrossover::new("x", Symbol::new(1), &params(2, 4)).unwrap();
        assert!(
            s.update_params(&serde_json::json!({"fast": 0, "slow": 4, "qty": "1"}))
                .is_err()
        );
    }
}
