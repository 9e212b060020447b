//! Market-making template
//!
//! Quotes mid ± half-spread with an inventory skew: a long book shades
//! both quotes down to encourage selling, a short book shades them up.
//! Quotes refresh only when the mid moves beyond a requote distance.

use crate::{ExecutionUpdate, Signal, Strategy};
use arc_swap::ArcSwap;
use common::{MarketEvent, MarketPayload, OrderType, Px, Qty, Side, Symbol, TimeInForce};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Params {
    /// Half-spread in price ticks
    half_spread_ticks: i64,
    /// Quote size
    qty: Qty,
    /// Ticks of shade per unit of inventory (scaled by qty)
    skew_ticks: i64,
    /// Re-quote when the mid moves at least this many ticks
    requote_ticks: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParams {
    half_spread: String,
    qty: String,
    skew: String,
    requote: String,
}

impl Default for RawParams {
    fn default() -> Self {
        Self {
            half_spread: "0.5".to_string(),
            qty: "0.001".to_string(),
            skew: "0.1".to_string(),
            requote: "0.1".to_string(),
        }
    }
}

impl RawParams {
    fn parse(self) -> anyhow::Result<Params> {
        let px = |s: &str| {
            Px::parse(s)
                .map(|p| p.as_i64())
                .map_err(|e| anyhow::anyhow!("price field: {e}"))
        };
        let params = Params {
            half_spread_ticks: px(&self.half_spread)?,
            qty: Qty::parse(&self.qty).map_err(|e| anyhow::anyhow!("qty: {e}"))?,
            skew_ticks: px(&self.skew)?,
            requote_ticks: px(&self.requote)?,
        };
        anyhow::ensure!(params.half_spread_ticks > 0, "half spread must be positive");
        Ok(params)
    }
}

/// The template
pub struct MarketMaker {
    id: String,
    symbol: Symbol,
    params: ArcSwap<Params>,
    mid: Option<i64>,
    last_quoted_mid: Option<i64>,
    /// Signed inventory in quantity units
    inventory: i64,
    pending: Vec<Signal>,
}

impl MarketMaker {
    /// Build from a JSON parameter object
    pub fn new(id: &str, symbol: Symbol, params: &serde_json::Value) -> anyhow::Result<Self> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        Ok(Self {
            id: id.to_string(),
            symbol,
            params: ArcSwap::from_pointee(raw.parse()?),
            mid: None,
            last_quoted_mid: None,
            inventory: 0,
            pending: Vec::new(),
        })
    }

    fn maybe_quote(&mut self) {
        let Some(mid) = self.mid else {
            return;
        };
        let params = self.params.load();
        if let Some(last) = self.last_quoted_mid {
            if (mid - last).abs() < params.requote_ticks {
                return;
            }
        }

        // Inventory skew in ticks, proportional to inventory in quote units.
        let qty_units = params.qty.as_i64().max(1);
        let skew = -self.inventory * params.skew_ticks / qty_units;
        let center = mid + skew;

        let bid = center - params.half_spread_ticks;
        let ask = center + params.half_spread_ticks;
        self.pending.push(Signal {
            symbol: self.symbol,
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(Px::from_i64(bid)),
            qty: params.qty,
            tif: TimeInForce::Gtc,
        });
        self.pending.push(Signal {
            symbol: self.symbol,
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: Some(Px::from_i64(ask)),
            qty: params.qty,
            tif: TimeInForce::Gtc,
        });
        self.last_quoted_mid = Some(mid);
    }
}

impl Strategy for MarketMaker {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) {
        self.mid = None;
        self.last_quoted_mid = None;
        self.inventory = 0;
        self.pending.clear();
    }

    fn on_market_event(&mut self, event: &MarketEvent) -> anyhow::Result<()> {
        if event.symbol != self.symbol {
            return Ok(());
        }
        if let MarketPayload::Ticker(ticker) = &event.payload {
            if let (Some((bid, _)), Some((ask, _))) = (ticker.bid, ticker.ask) {
                self.mid = Some((bid.as_i64() + ask.as_i64()) / 2);
                self.maybe_quote();
            }
        }
        Ok(())
    }

    fn on_position_update(&mut self, update: &ExecutionUpdate) {
        if let ExecutionUpdate::Position(position) = update {
            if position.symbol == self.symbol {
                self.inventory = position.qty;
                // Inventory changed; requote at the next opportunity.
                self.last_quoted_mid = None;
            }
        }
    }

    fn get_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.pending)
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        let raw: RawParams = serde_json::from_value(params.clone())?;
        self.params.store(Arc::new(raw.parse()?));
        self.last_quoted_mid = None;
        Ok(())
    }
}
