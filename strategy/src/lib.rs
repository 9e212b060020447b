//! Strategy runtime for the Quasar engine
//!
//! Strategies are event sinks driven from the market dispatcher: they
//! never block, never own orders or positions, and communicate with the
//! execution layer only by emitting [`Signal`]s that the runtime pulls
//! each tick and the [`bridge::SignalBridge`] converts into risk-checked
//! order requests.

pub mod bridge;
pub mod builtin;
pub mod runtime;

use common::{ClientOrderId, MarketEvent, OrderType, Px, Qty, Side, Symbol, TimeInForce, Ts};
use execution::Position;

/// A trading intention emitted by a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Instrument
    pub symbol: Symbol,
    /// Buy or sell
    pub side: Side,
    /// Price semantics
    pub order_type: OrderType,
    /// Limit price; `None` for market orders
    pub price: Option<Px>,
    /// Quantity
    pub qty: Qty,
    /// Time in force
    pub tif: TimeInForce,
}

/// Execution-side feedback delivered to strategies after the OMS updated
#[derive(Debug, Clone)]
pub enum ExecutionUpdate {
    /// Position changed (a fill was applied)
    Position(Position),
    /// An order reached a new state
    OrderState {
        /// Order id
        client_id: ClientOrderId,
        /// Stable state tag
        state: String,
        /// Strategy that owns the order, if any
        strategy_id: Option<String>,
    },
    /// An order-scoped failure (risk reject, router failure)
    OrderFailed {
        /// Order id when one was allocated
        client_id: Option<ClientOrderId>,
        /// Stable error code
        code: String,
        /// Strategy that owns the order, if any
        strategy_id: Option<String>,
    },
}

/// The strategy contract
///
/// Callbacks run on the market dispatcher and must not block. A
/// returned error isolates the strategy: the runtime stops it, cancels
/// its subscriptions and the engine keeps running.
pub trait Strategy: Send {
    /// Unique instance id
    fn id(&self) -> &str;

    /// Called once before events flow
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the strategy stops (error or shutdown)
    fn on_stop(&mut self) {}

    /// Drop all transient state
    fn reset(&mut self);

    /// Market event sink
    fn on_market_event(&mut self, event: &MarketEvent) -> anyhow::Result<()>;

    /// Periodic timer tick
    fn on_timer(&mut self, _now: Ts) -> anyhow::Result<()> {
        Ok(())
    }

    /// Execution feedback sink
    fn on_position_update(&mut self, _update: &ExecutionUpdate) {}

    /// Drain pending signals; called by the runtime each tick
    fn get_signals(&mut self) -> Vec<Signal>;

    /// Atomically replace parameters from a config value
    ///
    /// Implementations swap an `ArcSwap` snapshot so in-flight event
    /// processing observes either the old or the new set, never a torn
    /// mix.
    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()>;
}

pub use bridge::{BridgeOutcome, SignalBridge};
pub use runtime::{StrategyRuntime, StrategyStatus};
