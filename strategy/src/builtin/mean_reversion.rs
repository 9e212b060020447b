//! Mean-reversion (z-score) template
//!
//! Fades moves beyond an entry z-score against the rolling mean and
//! flattens once the score decays inside the exit band.

use crate::{Signal, Strategy};
use arc_swap::ArcSwap;
use common::{MarketEvent, MarketPayload, OrderType, Qty, Side, Symbol, TimeInForce};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Params {
    window: usize,
    entry_z: f64,
    exit_z: f64,
    qty: Qty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParams {
    window: usize,
    entry_z: f64,
    exit_z: f64,
    qty: String,
}

impl Default for RawParams {
    fn default() -> Self {
        Self {
            window: 50,
            entry_z: 2.0,
            exit_z: 0.5,
            qty: "0.001".to_string(),
        }
    }
}

impl RawParams {
    fn parse(self) -> anyhow::Result<Params> {
        anyhow::ensure!(self.window >= 3, "window too small");
        anyhow::ensure!(self.entry_z > self.exit_z, "need entry_z > exit_z");
        Ok(Params {
            window: self.window,
            entry_z: self.entry_z,
            exit_z: self.exit_z,
            qty: Qty::parse(&self.qty).map_err(|e| anyhow::anyhow!("qty: {e}"))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exposure {
    Flat,
    Long,
    Short,
}

/// The template
pub struct MeanReversion {
    id: String,
    symbol: Symbol,
    params: ArcSwap<Params>,
    prices: VecDeque<f64>,
    exposure: Exposure,
    pending: Vec<Signal>,
}

impl MeanReversion {
    /// Build from a JSON parameter object
    pub fn new(id: &str, symbol: Symbol, params: &serde_json::Value) -> anyhow::Result<Self> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        Ok(Self {
            id: id.to_string(),
            symbol,
            params: ArcSwap::from_pointee(raw.parse()?),
            prices: VecDeque::new(),
            exposure: Exposure::Flat,
            pending: Vec::new(),
        })
    }

    fn zscore(&self) -> Option<f64> {
        let n = self.prices.len();
        if n < 3 {
            return None;
        }
        let mean = self.prices.iter().sum::<f64>() / n as f64;
        let var = self
            .prices
            .iter()
            .map(|p| (p - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std = var.sqrt();
        if std <= f64::EPSILON {
            return None;
        }
        let last = *self.prices.back()?;
        Some((last - mean) / std)
    }

    fn emit(&mut self, side: Side, price: common::Px, qty: Qty) {
        self.pending.push(Signal {
            symbol: self.symbol,
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            qty,
            tif: TimeInForce::Gtc,
        });
    }
}

impl Strategy for MeanReversion {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.exposure = Exposure::Flat;
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
        if self.prices.len() > params.window {
            self.prices.pop_front();
        }
        let Some(z) = self.zscore() else {
            return Ok(());
        };

        match self.exposure {
            Exposure::Flat if z > params.entry_z => {
                self.emit(Side::Sell, trade.price, params.qty);
                self.exposure = Exposure::Short;
            }
            Exposure::Flat if z < -params.entry_z => {
                self.emit(Side::Buy, trade.price, params.qty);
                self.exposure = Exposure::Long;
            }
            Exposure::Short if z.abs() < params.exit_z => {
                self.emit(Side::Buy, trade.price, params.qty);
                self.exposure = Exposure::Flat;
            }
            Exposure::Long if z.abs() < params.exit_z => {
                self.emit(Side::Sell, trade.price, params.qty);
                self.exposure = Exposure::Flat;
            }
            _ => {}
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

    #[test]
    fn fades_a_spike_then_flattens() {
        let sym = Symbol::new(1);
        let params = serde_json::json!({
            "window": 20, "entry_z": 2.0, "exit_z": 0.5, "qty": "1"
        });
        let mut s = MeanReversion::new("mr1", sym, &params).unwrap();

        // Noisy-but-flat history.
        let mut seq = 0;
        for i in 0..20 {
            seq += 1;
            let p = if i % 2 == 0 { "100.1" } else { "99.9" };
            s.on_market_event(&trade(sym, p, seq)).unwrap();
        }
        assert!(s.get_signals().is_empty());

        // Spike up: short entry.
        seq += 1;
        s.on_market_event(&trade(sym, "103", seq)).unwrap();
        let signals = s.get_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);

        // Decay back towards the mean: exit buy.
        let mut exited = false;
        for _ in 0..30 {
            seq += 1;
            s.on_market_event(&trade(sym, "100", seq)).unwrap();
            let signals = s.get_signals();
            if !signals.is_empty() {
                assert_eq!(signals[0].side, Side::Buy);
                exited = true;
                break;
            }
        }
        assert!(exited, "never flattened");
    }

    #[test]
    fn constant_prices_emit_nothing() {
        let sym = Symbol::new(1);
        let mut s = MeanReversion::new(
            "mr1",
            sym,
            &serde_json::json!({"window": 10, "entry_z": 2.0, "exit_z": 0.5, "qty": "1"}),
        )
        .unwrap();
        for seq in 1..100 {
            s.on_market_event(&trade(sym, "100", seq)).unwrap();
        }
        assert!(s.get_signals().is_empty());
    }
}
