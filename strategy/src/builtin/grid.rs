//! Grid template
//!
//! Lays an arithmetic or geometric ladder of resting limit orders
//! between a lower and upper bound: buys below the reference price,
//! sells above. A filled level re-arms on the opposite side one step
//! away.

use crate::{ExecutionUpdate, Signal, Strategy};
use arc_swap::ArcSwap;
use common::{MarketEvent, MarketPayload, OrderType, Px, Qty, Side, Symbol, TimeInForce};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Params {
    lower: i64,
    upper: i64,
    levels: usize,
    geometric: bool,
    qty: Qty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParams {
    lower: String,
    upper: String,
    levels: usize,
    geometric: bool,
    qty: String,
}

impl Default for RawParams {
    fn default() -> Self {
        Self {
            lower: "90".to_string(),
            upper: "110".to_string(),
            levels: 10,
            geometric: false,
            qty: "0.001".to_string(),
        }
    }
}

impl RawParams {
    fn parse(self) -> anyhow::Result<Params> {
        let lower = Px::parse(&self.lower)
            .map_err(|e| anyhow::anyhow!("lower: {e}"))?
            .as_i64();
        let upper = Px::parse(&self.upper)
            .map_err(|e| anyhow::anyhow!("upper: {e}"))?
            .as_i64();
        anyhow::ensure!(lower > 0 && upper > lower, "need upper > lower > 0");
        anyhow::ensure!((2..=200).contains(&self.levels), "levels out of range");
        Ok(Params {
            lower,
            upper,
            levels: self.levels,
            geometric: self.geometric,
            qty: Qty::parse(&self.qty).map_err(|e| anyhow::anyhow!("qty: {e}"))?,
        })
    }
}

/// The template
pub struct GridStrategy {
    id: String,
    symbol: Symbol,
    params: ArcSwap<Params>,
    ladder: Vec<i64>,
    placed: bool,
    pending: Vec<Signal>,
}

impl GridStrategy {
    /// Build from a JSON parameter object
    pub fn new(id: &str, symbol: Symbol, params: &serde_json::Value) -> anyhow::Result<Self> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        Ok(Self {
            id: id.to_string(),
            symbol,
            params: ArcSwap::from_pointee(raw.parse()?),
            ladder: Vec::new(),
            placed: false,
            pending: Vec::new(),
        })
    }

    fn build_ladder(params: &Params) -> Vec<i64> {
        let n = params.levels;
        let mut ladder = Vec::with_capacity(n);
        if params.geometric {
            let ratio = (params.upper as f64 / params.lower as f64).powf(1.0 / (n - 1) as f64);
            let mut level = params.lower as f64;
            for _ in 0..n {
                #[allow(clippy::cast_possible_truncation)]
                ladder.push(level.round() as i64);
                level *= ratio;
            }
        } else {
            let step = (params.upper - params.lower) / (n as i64 - 1);
            for i in 0..n {
                ladder.push(params.lower + step * i as i64);
            }
        }
        ladder
    }

    fn place_initial(&mut self, reference: i64) {
        let params = self.params.load();
        self.ladder = Self::build_ladder(&params);
        for level in &self.ladder {
            let side = if *level < reference {
                Side::Buy
            } else if *level > reference {
                Side::Sell
            } else {
                continue;
            };
            self.pending.push(Signal {
                symbol: self.symbol,
                side,
                order_type: OrderType::Limit,
                price: Some(Px::from_i64(*level)),
                qty: params.qty,
                tif: TimeInForce::Gtc,
            });
        }
        self.placed = true;
    }
}

impl Strategy for GridStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) {
        self.ladder.clear();
        self.placed = false;
        self.pending.clear();
    }

    fn on_market_event(&mut self, event: &MarketEvent) -> anyhow::Result<()> {
        if event.symbol != self.symbol || self.placed {
            return Ok(());
        }
        if let MarketPayload::Trade(trade) = &event.payload {
            self.place_initial(trade.price.as_i64());
        }
        Ok(())
    }

    fn on_position_update(&mut self, update: &ExecutionUpdate) {
        // A filled level re-arms the whole ladder around the new
        // reference on the next trade.
        if let ExecutionUpdate::OrderState {
            state, strategy_id, ..
        } = update
        {
            if strategy_id.as_deref() == Some(self.id.as_str()) && state == "filled" {
                self.placed = false;
            }
        }
    }

    fn get_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.pending)
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        self.params.store(Arc::new(raw.parse()?));
        // A new ladder takes effect from the next reference price.
        self.placed = false;
        self.ladder.clear();
        Ok(())
    }
}
