//! Order management system
//!
//! Owns every order, drives the state machine from router results and
//! exchange events, journals each change to the WAL before it becomes
//! visible, and keeps the position book current. Exchange events arrive
//! possibly out of order: they re-order by `(venue_order_id, event_seq)`
//! and events for an unknown venue id park briefly awaiting the submit
//! receipt.

pub mod journal;
pub mod lifecycle;
pub mod order;

use crate::adapter::ExchangeEvent;
use crate::position::{Position, PositionBook};
use common::{ClientOrderId, EngineError, Fill, PlaceOrderRequest, Symbol, Px, Ts, VenueOrderId};
use journal::{CheckpointRecord, FillRecord, OrderNewRecord, StateChangeRecord, kind};
use lifecycle::Lifecycle;
use order::{Order, OrderState};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use storage::{Recovery, Wal};
use tracing::{debug, error, info, warn};

/// How long events for an unknown venue id wait for their submit receipt
const PARK_TTL_NS: u64 = 2_000_000_000;

/// State changes the OMS surfaces to the engine
#[derive(Debug)]
pub enum OmsEvent {
    /// An order changed state or execution progress
    OrderUpdate {
        /// Snapshot of the order after the change
        order: Order,
    },
    /// A fill was recorded
    FillRecorded {
        /// The fill
        fill: Fill,
        /// Position after applying it
        position: Position,
    },
    /// An order-scoped failure
    OrderError {
        /// Order the failure refers to, when known
        client_id: Option<ClientOrderId>,
        /// The failure
        error: EngineError,
    },
}

#[derive(Debug)]
struct ParkedEvent {
    event: ExchangeEvent,
    parked_at: Ts,
}

#[derive(Debug, Default)]
struct ReorderState {
    next_seq: u64,
    pending: BTreeMap<u64, ExchangeEvent>,
}

/// The order manager
pub struct OrderManager {
    orders: FxHashMap<ClientOrderId, Order>,
    by_venue: FxHashMap<VenueOrderId, ClientOrderId>,
    reorder: FxHashMap<VenueOrderId, ReorderState>,
    parked: Vec<ParkedEvent>,
    positions: PositionBook,
    wal: Option<Wal>,
    wal_failed: bool,
}

impl OrderManager {
    /// Create a manager; `wal` enables journaling
    #[must_use]
    pub fn new(wal: Option<Wal>) -> Self {
        Self {
            orders: FxHashMap::default(),
            by_venue: FxHashMap::default(),
            reorder: FxHashMap::default(),
            parked: Vec::new(),
            positions: PositionBook::new(),
            wal,
            wal_failed: false,
        }
    }

    /// Rebuild state by replaying recovered WAL records
    pub fn recover(&mut self, recovery: &Recovery) -> anyhow::Result<usize> {
        let mut applied = 0;
        for record in &recovery.records {
            match record.kind {
                kind::CHECKPOINT => {
                    let ckpt: CheckpointRecord = bincode::deserialize(&record.payload)?;
                    self.orders.clear();
                    self.by_venue.clear();
                    for order in ckpt.orders {
                        if let Some(vid) = &order.venue_order_id {
                            self.by_venue.insert(vid.clone(), order.client_id.clone());
                        }
                        self.orders.insert(order.client_id.clone(), order);
                    }
                    self.positions = PositionBook::new();
                    for position in ckpt.positions {
                        self.positions.restore(position);
                    }
                }
                kind::ORDER_NEW => {
                    let rec: OrderNewRecord = bincode::deserialize(&record.payload)?;
                    let order = Order::from_request(&rec.request, rec.ts);
                    self.orders.insert(order.client_id.clone(), order);
                }
                kind::STATE_CHANGE => {
                    let rec: StateChangeRecord = bincode::deserialize(&record.payload)?;
                    if let Some(order) = self.orders.get_mut(&rec.client_id) {
                        order.state = rec.state;
                        order.updated_ts = rec.ts;
                        if let Some(vid) = rec.venue_order_id {
                            self.by_venue.insert(vid.clone(), rec.client_id.clone());
                            order.venue_order_id = Some(vid);
                        }
                    }
                }
                kind::FILL => {
                    let rec: FillRecord = bincode::deserialize(&record.payload)?;
                    if let Some(order) = self.orders.get_mut(&rec.fill.client_id) {
                        order.apply_fill(&rec.fill);
                        self.positions.on_fill(
                            order.symbol,
                            order.side,
                            rec.fill.qty,
                            rec.fill.price,
                            rec.fill.fee,
                            rec.fill.ts,
                        );
                    }
                }
                other => warn!(kind = other, "skipping unknown wal record"),
            }
            applied += 1;
        }
        if applied > 0 {
            info!(records = applied, "oms state recovered from wal");
        }
        Ok(applied)
    }

    /// Whether the journal is still healthy
    #[must_use]
    pub const fn accepting_orders(&self) -> bool {
        !self.wal_failed
    }

    /// Register a brand-new order
    ///
    /// Fails with `IdCollision` when the client id is already known, and
    /// with `WalWrite` once the journal has failed.
    pub fn register_new(
        &mut self,
        req: &PlaceOrderRequest,
        now: Ts,
    ) -> Result<Vec<OmsEvent>, EngineError> {
        if self.wal_failed {
            return Err(EngineError::WalWrite("journal unavailable".into()));
        }
        if self.orders.contains_key(&req.client_id) {
            return Err(EngineError::IdCollision(req.client_id.to_string()));
        }

        self.journal(
            kind::ORDER_NEW,
            &OrderNewRecord {
                request: req.clone(),
                ts: now,
            },
        )?;

        let order = Order::from_request(req, now);
        let snapshot = order.clone();
        self.orders.insert(req.client_id.clone(), order);
        Ok(vec![OmsEvent::OrderUpdate { order: snapshot }])
    }

    /// Router handed the order to the venue
    pub fn mark_submitted(&mut self, client_id: &ClientOrderId, now: Ts) -> Vec<OmsEvent> {
        self.transition(client_id, OrderState::Submitted, None, now)
    }

    /// Router gave up before venue accept; `error` is the terminal failure
    pub fn mark_rejected(
        &mut self,
        client_id: &ClientOrderId,
        error: EngineError,
        now: Ts,
    ) -> Vec<OmsEvent> {
        let mut events = self.transition(client_id, OrderState::Rejected, None, now);
        events.push(OmsEvent::OrderError {
            client_id: Some(client_id.clone()),
            error,
        });
        events
    }

    /// Record local cancel intent
    pub fn request_cancel(
        &mut self,
        client_id: &ClientOrderId,
        now: Ts,
    ) -> Result<Vec<OmsEvent>, EngineError> {
        let order = self
            .orders
            .get(client_id)
            .ok_or_else(|| EngineError::UnknownOrder(client_id.to_string()))?;
        if order.is_terminal() {
            debug!(order = %client_id, state = order.state.as_str(), "cancel on terminal order ignored");
            return Ok(Vec::new());
        }
        if !Lifecycle::can_request_cancel(order.state) {
            return Err(EngineError::Internal(format!(
                "cancel not possible in state {}",
                order.state.as_str()
            )));
        }
        Ok(self.transition(client_id, OrderState::CancelRequested, None, now))
    }

    /// Apply one exchange event, re-ordering per order as needed
    pub fn on_exchange_event(&mut self, event: ExchangeEvent, now: Ts) -> Vec<OmsEvent> {
        match &event {
            ExchangeEvent::Ack {
                client_id,
                venue_order_id,
                event_seq,
                ts,
            } => {
                let mut events = self.apply_ack(
                    client_id.clone(),
                    venue_order_id.clone(),
                    *event_seq,
                    *ts,
                );
                events.extend(self.unpark_for(venue_order_id.clone(), now));
                events
            }
            ExchangeEvent::Reject { client_id, code, msg, ts } => {
                let code = code.clone();
                let msg = msg.clone();
                let client_id = client_id.clone();
                let ts = *ts;
                let mut events = self.transition(&client_id, OrderState::Rejected, None, ts);
                events.push(OmsEvent::OrderError {
                    client_id: Some(client_id),
                    error: EngineError::ExchangeReject { code, msg },
                });
                events
            }
            ExchangeEvent::Fill { venue_order_id, .. }
            | ExchangeEvent::CancelAck { venue_order_id, .. }
            | ExchangeEvent::Expired { venue_order_id, .. } => {
                let vid = venue_order_id.clone();
                if self.by_venue.contains_key(&vid) {
                    self.sequenced(vid, event, now)
                } else {
                    debug!(venue_order_id = %vid, "parking event for unknown venue id");
                    self.parked.push(ParkedEvent {
                        event,
                        parked_at: now,
                    });
                    Vec::new()
                }
            }
        }
    }

    /// Drop parked events older than the reconciliation window
    pub fn sweep_parked(&mut self, now: Ts) -> Vec<OmsEvent> {
        let mut events = Vec::new();
        self.parked.retain(|parked| {
            if now.saturating_sub(parked.parked_at) > PARK_TTL_NS {
                warn!(event = ?parked.event, "dropping parked event; no submit receipt arrived");
                events.push(OmsEvent::OrderError {
                    client_id: None,
                    error: EngineError::UnknownOrder(format!("{:?}", parked.event)),
                });
                false
            } else {
                true
            }
        });
        events
    }

    /// Order snapshot by client id
    #[must_use]
    pub fn query(&self, client_id: &ClientOrderId) -> Option<Order> {
        self.orders.get(client_id).cloned()
    }

    /// Position book view
    #[must_use]
    pub const fn positions(&self) -> &PositionBook {
        &self.positions
    }

    /// Update a mark price for unrealized P&L
    pub fn on_mark(&mut self, symbol: Symbol, mark: Px, now: Ts) -> Option<Position> {
        self.positions.on_mark(symbol, mark, now)
    }

    /// Write a compacted snapshot and drop superseded segments
    pub fn checkpoint(&mut self, now: Ts) -> Result<(), EngineError> {
        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };
        let record = CheckpointRecord {
            orders: self.orders.values().cloned().collect(),
            positions: self.positions.open_positions(),
            ts: now,
        };
        let payload = bincode::serialize(&record)
            .map_err(|e| EngineError::Internal(format!("checkpoint encode: {e}")))?;
        wal.checkpoint(kind::CHECKPOINT, &payload)
            .map_err(|e| EngineError::WalWrite(e.to_string()))?;
        Ok(())
    }

    /// Flush the journal (called on the flush timer and at shutdown)
    pub fn flush_wal(&mut self) -> Result<(), EngineError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.flush().map_err(|e| {
                self.wal_failed = true;
                EngineError::WalWrite(e.to_string())
            })?;
        }
        Ok(())
    }

    /// Drop terminal orders older than the reconciliation window
    pub fn prune_terminal(&mut self, now: Ts, keep_ns: u64) -> usize {
        let stale: Vec<ClientOrderId> = self
            .orders
            .iter()
            .filter(|(_, o)| o.is_terminal() && now.saturating_sub(o.updated_ts) > keep_ns)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(order) = self.orders.remove(id) {
                if let Some(vid) = order.venue_order_id {
                    self.by_venue.remove(&vid);
                    self.reorder.remove(&vid);
                }
            }
        }
        stale.len()
    }

    fn apply_ack(
        &mut self,
        client_id: ClientOrderId,
        venue_order_id: VenueOrderId,
        event_seq: u64,
        ts: Ts,
    ) -> Vec<OmsEvent> {
        if !self.orders.contains_key(&client_id) {
            warn!(order = %client_id, "ack for unknown order");
            return vec![OmsEvent::OrderError {
                client_id: Some(client_id.clone()),
                error: EngineError::UnknownOrder(client_id.to_string()),
            }];
        }
        self.by_venue
            .insert(venue_order_id.clone(), client_id.clone());
        self.reorder.insert(
            venue_order_id.clone(),
            ReorderState {
                next_seq: event_seq + 1,
                pending: BTreeMap::new(),
            },
        );
        self.transition(&client_id, OrderState::Accepted, Some(venue_order_id), ts)
    }

    /// Feed one keyed event through the per-order re-order buffer
    fn sequenced(&mut self, vid: VenueOrderId, event: ExchangeEvent, now: Ts) -> Vec<OmsEvent> {
        let seq = match &event {
            ExchangeEvent::Fill { event_seq, .. }
            | ExchangeEvent::CancelAck { event_seq, .. }
            | ExchangeEvent::Expired { event_seq, .. } => *event_seq,
            _ => 0,
        };
        let state = self.reorder.entry(vid.clone()).or_default();
        if state.next_seq == 0 {
            state.next_seq = seq; // no ack seq known; accept as-is
        }

        if seq > state.next_seq {
            debug!(venue_order_id = %vid, seq, expected = state.next_seq, "buffering out-of-order event");
            state.pending.insert(seq, event);
            return Vec::new();
        }
        if seq < state.next_seq {
            debug!(venue_order_id = %vid, seq, "dropping duplicate exchange event");
            return Vec::new();
        }

        let mut events = self.apply_keyed(&vid, event, now);
        // Drain any directly-following buffered events.
        loop {
            let Some(state) = self.reorder.get_mut(&vid) else {
                break;
            };
            state.next_seq += 1;
            let next = state.next_seq;
            match state.pending.remove(&next) {
                Some(pending) => events.extend(self.apply_keyed(&vid, pending, now)),
                None => break,
            }
        }
        events
    }

    fn apply_keyed(&mut self, vid: &VenueOrderId, event: ExchangeEvent, _now: Ts) -> Vec<OmsEvent> {
        let Some(client_id) = self.by_venue.get(vid).cloned() else {
            return Vec::new();
        };
        match event {
            ExchangeEvent::Fill { fill, .. } => self.apply_fill(&client_id, fill),
            ExchangeEvent::CancelAck { ts, .. } => self.apply_cancel_ack(&client_id, ts),
            ExchangeEvent::Expired { ts, .. } => {
                self.transition(&client_id, OrderState::Expired, None, ts)
            }
            _ => Vec::new(),
        }
    }

    fn apply_fill(&mut self, client_id: &ClientOrderId, fill: Fill) -> Vec<OmsEvent> {
        let Some(order) = self.orders.get(client_id) else {
            return Vec::new();
        };
        if order.is_terminal() {
            debug!(order = %client_id, "fill on terminal order ignored");
            return Vec::new();
        }
        if fill.qty.is_zero() {
            return Vec::new();
        }
        if order.exec_qty.add(fill.qty) > order.qty {
            error!(order = %client_id, "overfill reported by venue");
            return vec![OmsEvent::OrderError {
                client_id: Some(client_id.clone()),
                error: EngineError::Internal("overfill".into()),
            }];
        }

        if let Err(e) = self.journal(kind::FILL, &FillRecord { fill: fill.clone() }) {
            return vec![OmsEvent::OrderError {
                client_id: Some(client_id.clone()),
                error: e,
            }];
        }

        let order = self.orders.get_mut(client_id).expect("checked above");
        order.apply_fill(&fill);
        let position = self.positions.on_fill(
            order.symbol,
            order.side,
            fill.qty,
            fill.price,
            fill.fee,
            fill.ts,
        );

        let mut events = vec![OmsEvent::FillRecorded {
            fill: fill.clone(),
            position,
        }];
        let filled = order.exec_qty == order.qty;
        let next_state = if filled {
            Some(OrderState::Filled)
        } else if order.state == OrderState::CancelRequested {
            // Cancel race: execution progress reported, intent preserved.
            None
        } else {
            Some(OrderState::PartiallyFilled)
        };
        match next_state {
            Some(state) => events.extend(self.transition(client_id, state, None, fill.ts)),
            None => {
                let snapshot = self.orders.get(client_id).expect("checked above").clone();
                events.push(OmsEvent::OrderUpdate { order: snapshot });
            }
        }
        events
    }

    fn apply_cancel_ack(&mut self, client_id: &ClientOrderId, ts: Ts) -> Vec<OmsEvent> {
        let Some(order) = self.orders.get(client_id) else {
            return Vec::new();
        };
        if order.is_terminal() {
            // Fill won the race; the late ack changes nothing.
            info!(order = %client_id, state = order.state.as_str(), "late cancel ack ignored");
            return Vec::new();
        }
        self.transition(client_id, OrderState::Cancelled, None, ts)
    }

    fn transition(
        &mut self,
        client_id: &ClientOrderId,
        to: OrderState,
        venue_order_id: Option<VenueOrderId>,
        ts: Ts,
    ) -> Vec<OmsEvent> {
        let Some(order) = self.orders.get(client_id) else {
            warn!(order = %client_id, "transition for unknown order");
            return vec![OmsEvent::OrderError {
                client_id: Some(client_id.clone()),
                error: EngineError::UnknownOrder(client_id.to_string()),
            }];
        };
        let from = order.state;
        if !Lifecycle::is_valid(from, to) {
            warn!(
                order = %client_id,
                from = from.as_str(),
                to = to.as_str(),
                "illegal transition ignored"
            );
            return Vec::new();
        }

        if let Err(e) = self.journal(
            kind::STATE_CHANGE,
            &StateChangeRecord {
                client_id: client_id.clone(),
                state: to,
                venue_order_id: venue_order_id.clone(),
                ts,
            },
        ) {
            return vec![OmsEvent::OrderError {
                client_id: Some(client_id.clone()),
                error: e,
            }];
        }

        let order = self.orders.get_mut(client_id).expect("checked above");
        order.state = to;
        order.updated_ts = ts;
        if let Some(vid) = venue_order_id {
            order.venue_order_id = Some(vid);
        }
        debug!(order = %client_id, from = from.as_str(), to = to.as_str(), "order transition");
        vec![OmsEvent::OrderUpdate {
            order: order.clone(),
        }]
    }

    /// Re-feed parked events now that their venue id resolved
    fn unpark_for(&mut self, vid: VenueOrderId, now: Ts) -> Vec<OmsEvent> {
        let (matching, rest): (Vec<ParkedEvent>, Vec<ParkedEvent>) =
            std::mem::take(&mut self.parked).into_iter().partition(|p| {
                matches!(
                    &p.event,
                    ExchangeEvent::Fill { venue_order_id, .. }
                    | ExchangeEvent::CancelAck { venue_order_id, .. }
                    | ExchangeEvent::Expired { venue_order_id, .. }
                        if *venue_order_id == vid
                )
            });
        self.parked = rest;
        let mut events = Vec::new();
        for parked in matching {
            events.extend(self.sequenced(vid.clone(), parked.event, now));
        }
        events
    }

    fn journal<T: serde::Serialize>(&mut self, kind: u8, record: &T) -> Result<(), EngineError> {
        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };
        wal.append_entry(kind, record).map_err(|e| {
            error!(error = %e, "wal append failed; refusing new orders");
            self.wal_failed = true;
            EngineError::WalWrite(e.to_string())
        })?;
        Ok(())
    }
}

