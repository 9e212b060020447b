//! Exchange adapter contract
//!
//! The engine talks to every venue through this narrow async trait.
//! Adapter bodies are venue-specific; the engine only depends on the
//! call shapes, the error taxonomy and the user-stream event feed.

use async_trait::async_trait;
use common::{ClientOrderId, Fill, PlaceOrderRequest, Px, Qty, Symbol, Ts, Venue, VenueOrderId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure modes an adapter call can produce
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Throttled by the venue; retry after the hint
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Venue-suggested wait
        retry_after: Duration,
    },
    /// Transport-level failure
    #[error("network: {0}")]
    Network(String),
    /// Credentials rejected
    #[error("auth: {0}")]
    Auth(String),
    /// The request was malformed or violates venue rules
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The venue rejected the order outright
    #[error("exchange reject {code}: {msg}")]
    ExchangeReject {
        /// Venue reject code
        code: String,
        /// Venue message
        msg: String,
    },
    /// The call deadline expired
    #[error("timeout: {0}")]
    Timeout(String),
}

impl AdapterError {
    /// True when the router may retry the call
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }
}

/// Successful order placement receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// Exchange-assigned id
    pub venue_order_id: VenueOrderId,
    /// Venue receipt time
    pub ts: Ts,
}

/// Order state as reported by the venue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusReport {
    /// Caller id
    pub client_id: ClientOrderId,
    /// Exchange id, when assigned
    pub venue_order_id: Option<VenueOrderId>,
    /// Venue status string, venue-specific vocabulary
    pub status: String,
    /// Executed quantity
    pub exec_qty: Qty,
    /// Average execution price
    pub avg_price: Px,
}

/// One asset balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    /// Asset code, e.g. `USDT`
    pub asset: String,
    /// Free quantity
    pub free: Qty,
    /// Locked quantity
    pub locked: Qty,
}

/// Events arriving on the venue's user data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The venue accepted an order
    Ack {
        /// Caller id
        client_id: ClientOrderId,
        /// Exchange id
        venue_order_id: VenueOrderId,
        /// Per-order event sequence
        event_seq: u64,
        /// Venue time
        ts: Ts,
    },
    /// An execution
    Fill {
        /// Exchange id the fill belongs to
        venue_order_id: VenueOrderId,
        /// Execution details
        fill: Fill,
        /// Per-order event sequence
        event_seq: u64,
    },
    /// The venue confirmed a cancel
    CancelAck {
        /// Exchange id
        venue_order_id: VenueOrderId,
        /// Per-order event sequence
        event_seq: u64,
        /// Venue time
        ts: Ts,
    },
    /// The venue rejected the order after submission
    Reject {
        /// Caller id
        client_id: ClientOrderId,
        /// Venue reject code
        code: String,
        /// Venue message
        msg: String,
        /// Venue time
        ts: Ts,
    },
    /// Time-in-force expiry
    Expired {
        /// Exchange id
        venue_order_id: VenueOrderId,
        /// Per-order event sequence
        event_seq: u64,
        /// Venue time
        ts: Ts,
    },
}

/// The uniform venue façade
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Venue this adapter serves
    fn venue(&self) -> Venue;

    /// Place an order
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck, AdapterError>;

    /// Cancel by client id
    async fn cancel_order(
        &self,
        symbol: Symbol,
        client_id: &ClientOrderId,
    ) -> Result<(), AdapterError>;

    /// Query current order state
    async fn query_order(
        &self,
        symbol: Symbol,
        client_id: &ClientOrderId,
    ) -> Result<OrderStatusReport, AdapterError>;

    /// Fetch account balances
    async fn fetch_balances(&self) -> Result<Vec<Balance>, AdapterError>;

    /// Request market-stream subscriptions for symbols
    async fn subscribe_market(&self, symbols: &[Symbol]) -> Result<(), AdapterError>;

    /// Open the user data stream; events flow into `tx`
    async fn subscribe_user_stream(
        &self,
        tx: mpsc::Sender<ExchangeEvent>,
    ) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_router_policy() {
        assert!(AdapterError::Network("reset".into()).is_retryable());
        assert!(AdapterError::Timeout("deadline".into()).is_retryable());
        assert!(
            AdapterError::RateLimited {
                retry_after: Duration::from_millis(100)
            }
            .is_retryable()
        );
        assert!(!AdapterError::Auth("denied".into()).is_retryable());
        assert!(!AdapterError::InvalidRequest("bad qty".into()).is_retryable());
        assert!(
            !AdapterError::ExchangeReject {
                code: "-2010".into(),
                msg: "balance".into()
            }
            .is_retryable()
        );
    }
}
