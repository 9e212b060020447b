//! Shared foundation for the Quasar trading engine
//!
//! Fixed-point market types, the error taxonomy, configuration, the
//! engine clock, retry policies and the metrics registry. Everything here
//! is dependency-light so every other crate in the workspace can use it.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod instrument;
pub mod market;
pub mod metrics;
pub mod order;
pub mod retry;
pub mod types;

pub use error::EngineError;
pub use instrument::{Instrument, ScaleInfo, SymbolRegistry};
pub use market::{
    BookDelta, BookSnapshot, BookTop, KlineData, MarketEvent, MarketPayload, StreamKind,
    TickerData, TradeEvent,
};
pub use order::{Fill, OrderIntent, OrderType, PlaceOrderRequest, TimeInForce};
pub use retry::{Backoff, RetryPolicy};
pub use types::{ClientOrderId, Px, Qty, Side, Symbol, Ts, Venue, VenueOrderId};
