//! Execution engine for Quasar
//!
//! Everything between a strategy signal and an exchange: idempotent id
//! allocation, the adapter contract, the resilient order router, the OMS
//! state machine with its write-ahead journal, and the position book.

pub mod adapter;
pub mod ids;
pub mod oms;
pub mod position;
pub mod rate_limit;
pub mod router;
pub mod signing;
pub mod sim;

pub use adapter::{
    AdapterError, Balance, ExchangeAdapter, ExchangeEvent, OrderAck, OrderStatusReport,
};
pub use ids::IdAllocator;
pub use oms::order::{Order, OrderState};
pub use oms::{OmsEvent, OrderManager};
pub use position::{Position, PositionBook};
pub use rate_limit::TokenBucket;
pub use router::OrderRouter;
pub use signing::RequestSigner;
pub use sim::SimAdapter;
