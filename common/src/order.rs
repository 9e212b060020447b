//! Shared order-path types: requests, fills, order kinds

use crate::types::{ClientOrderId, Px, Qty, Side, Symbol, Ts, Venue, VenueOrderId};
use serde::{Deserialize, Serialize};

/// Order price semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute at a limit price or better
    Limit,
    /// Execute immediately at the prevailing price
    Market,
}

/// Time-in-force semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Good till cancelled
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

/// The economically relevant core of an order, before an id or venue is
/// attached; what the risk engine evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Instrument
    pub symbol: Symbol,
    /// Buy or sell
    pub side: Side,
    /// Price semantics
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<Px>,
    /// Order quantity
    pub qty: Qty,
}

/// A request to place an order, as emitted by strategies and the stdio layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Idempotent caller-assigned id
    pub client_id: ClientOrderId,
    /// Target venue
    pub venue: Venue,
    /// Instrument
    pub symbol: Symbol,
    /// Buy or sell
    pub side: Side,
    /// Price semantics
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<Px>,
    /// Order quantity
    pub qty: Qty,
    /// Time in force
    pub tif: TimeInForce,
    /// Strategy that originated the request, if any
    pub strategy_id: Option<String>,
}

impl PlaceOrderRequest {
    /// The intent the risk engine evaluates
    #[must_use]
    pub const fn intent(&self) -> OrderIntent {
        OrderIntent {
            symbol: self.symbol,
            side: self.side,
            order_type: self.order_type,
            price: self.price,
            qty: self.qty,
        }
    }
}

/// An immutable execution record
///
/// Fills are append-only: they are journaled to the WAL before any state
/// derived from them becomes visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Order the fill belongs to
    pub client_id: ClientOrderId,
    /// Exchange-assigned order id
    pub venue_order_id: VenueOrderId,
    /// Executed quantity, always positive
    pub qty: Qty,
    /// Execution price
    pub price: Px,
    /// Fee charged, in price ticks
    pub fee: i64,
    /// Execution time
    pub ts: Ts,
}
