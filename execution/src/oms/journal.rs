//! OMS journal records
//!
//! Typed payloads for the WAL. Every state-changing OMS operation is
//! journaled before the change becomes visible; recovery replays records
//! in sequence order to rebuild orders and positions.

use super::order::{Order, OrderState};
use crate::position::Position;
use common::{ClientOrderId, Fill, PlaceOrderRequest, Ts, VenueOrderId};
use serde::{Deserialize, Serialize};

/// WAL record kind tags
pub mod kind {
    /// New order registered
    pub const ORDER_NEW: u8 = 1;
    /// State transition
    pub const STATE_CHANGE: u8 = 2;
    /// Fill applied
    pub const FILL: u8 = 3;
    /// Compacted snapshot
    pub const CHECKPOINT: u8 = 4;
}

/// A new order entering the OMS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNewRecord {
    /// The originating request
    pub request: PlaceOrderRequest,
    /// Registration time
    pub ts: Ts,
}

/// One state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeRecord {
    /// Order the transition applies to
    pub client_id: ClientOrderId,
    /// New state
    pub state: OrderState,
    /// Venue id, when newly learned
    pub venue_order_id: Option<VenueOrderId>,
    /// Transition time
    pub ts: Ts,
}

/// One fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    /// The fill
    pub fill: Fill,
}

/// Compacted OMS state written at checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Orders still inside their lifecycle or reconciliation window
    pub orders: Vec<Order>,
    /// All positions
    pub positions: Vec<Position>,
    /// Checkpoint time
    pub ts: Ts,
}
