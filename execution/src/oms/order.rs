//! Order model

use common::{
    ClientOrderId, Fill, OrderType, PlaceOrderRequest, Px, Qty, Side, Symbol, TimeInForce, Ts,
    Venue, VenueOrderId,
};
use serde::{Deserialize, Serialize};

/// Order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Created locally, not yet handed to the router
    New,
    /// Enqueued to the router / sent to the venue
    Submitted,
    /// Venue acknowledged with a venue order id
    Accepted,
    /// Some quantity executed
    PartiallyFilled,
    /// Fully executed
    Filled,
    /// Cancel requested locally, awaiting venue ack
    CancelRequested,
    /// Venue confirmed the cancel
    Cancelled,
    /// Venue rejected the order
    Rejected,
    /// Time-in-force expiry
    Expired,
}

impl OrderState {
    /// Terminal states are absorbing
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Stable snake_case tag used in events
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Submitted => "submitted",
            Self::Accepted => "accepted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

/// One order owned by the OMS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Idempotent caller id
    pub client_id: ClientOrderId,
    /// Venue the order routes to
    pub venue: Venue,
    /// Instrument
    pub symbol: Symbol,
    /// Buy or sell
    pub side: Side,
    /// Price semantics
    pub order_type: OrderType,
    /// Limit price, if any
    pub price: Option<Px>,
    /// Requested quantity
    pub qty: Qty,
    /// Time in force
    pub tif: TimeInForce,
    /// Current state
    pub state: OrderState,
    /// Executed quantity; never exceeds `qty`
    pub exec_qty: Qty,
    /// Quantity-weighted average execution price
    pub avg_price: Px,
    /// Exchange id once accepted
    pub venue_order_id: Option<VenueOrderId>,
    /// Originating strategy, if any
    pub strategy_id: Option<String>,
    /// Creation time
    pub created_ts: Ts,
    /// Last state change time
    pub updated_ts: Ts,
    /// Fills applied so far
    pub fills: Vec<Fill>,
}

impl Order {
    /// Build a new order from a request
    #[must_use]
    pub fn from_request(req: &PlaceOrderRequest, ts: Ts) -> Self {
        Self {
            client_id: req.client_id.clone(),
            venue: req.venue,
            symbol: req.symbol,
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            qty: req.qty,
            tif: req.tif,
            state: OrderState::New,
            exec_qty: Qty::ZERO,
            avg_price: Px::ZERO,
            venue_order_id: None,
            strategy_id: req.strategy_id.clone(),
            created_ts: ts,
            updated_ts: ts,
            fills: Vec::new(),
        }
    }

    /// Unfilled quantity
    #[must_use]
    pub fn remaining(&self) -> Qty {
        self.qty.sub(self.exec_qty)
    }

    /// True once in a terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Fold a fill into exec_qty and the weighted average price
    pub fn apply_fill(&mut self, fill: &Fill) {
        let old_exec = self.exec_qty.as_i64();
        let add = fill.qty.as_i64();
        let new_exec = old_exec + add;
        if new_exec > 0 {
            let weighted = (i128::from(self.avg_price.as_i64()) * i128::from(old_exec)
                + i128::from(fill.price.as_i64()) * i128::from(add))
                / i128::from(new_exec);
            self.avg_price = Px::from_i64(i64::try_from(weighted).unwrap_or(i64::MAX));
        }
        self.exec_qty = Qty::from_i64(new_exec);
        self.fills.push(fill.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_accumulation_weights_average() {
        let req = PlaceOrderRequest {
            client_id: ClientOrderId::new("c1").unwrap(),
            venue: Venue::Binance,
            symbol: Symbol::new(1),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(Px::parse("50000").unwrap()),
            qty: Qty::parse("0.001").unwrap(),
            tif: TimeInForce::Gtc,
            strategy_id: None,
        };
        let mut order = Order::from_request(&req, Ts::from_nanos(1));

        let client_id = order.client_id.clone();
        let fill = |q: &str, p: &str| Fill {
            client_id: client_id.clone(),
            venue_order_id: VenueOrderId::new("V1"),
            qty: Qty::parse(q).unwrap(),
            price: Px::parse(p).unwrap(),
            fee: 0,
            ts: Ts::from_nanos(2),
        };

        order.apply_fill(&fill("0.0004", "50000"));
        assert_eq!(order.exec_qty, Qty::parse("0.0004").unwrap());
        assert_eq!(order.avg_price, Px::parse("50000").unwrap());
        assert_eq!(order.remaining(), Qty::parse("0.0006").unwrap());

        order.apply_fill(&fill("0.0006", "49999"));
        assert_eq!(order.exec_qty, Qty::parse("0.001").unwrap());
        assert_eq!(order.avg_price, Px::parse("49999.4").unwrap());
        assert_eq!(order.remaining(), Qty::ZERO);
        assert_eq!(order.fills.len(), 2);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Accepted.is_terminal());
        assert!(!OrderState::CancelRequested.is_terminal());
    }
}
