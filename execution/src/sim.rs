//! Deterministic simulated exchange adapter
//!
//! Used in paper mode and by the test suite. Placements return a receipt
//! immediately; fills, cancel acks and expiries are injected by the
//! caller (or test) onto the user stream with per-order event sequences.
//! Failures can be scripted to exercise the router's retry and circuit
//! paths.

use crate::adapter::{
    AdapterError, Balance, ExchangeAdapter, ExchangeEvent, OrderAck, OrderStatusReport,
};
use async_trait::async_trait;
use common::{ClientOrderId, Fill, PlaceOrderRequest, Px, Qty, Symbol, Ts, Venue, VenueOrderId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct SimState {
    orders: Vec<(ClientOrderId, VenueOrderId)>,
    /// Next user-stream event seq per venue order (acks claim seq 1)
    event_seqs: Vec<(VenueOrderId, u64)>,
    fail_plan: VecDeque<AdapterError>,
    user_tx: Option<mpsc::Sender<ExchangeEvent>>,
}

/// Scriptable in-process venue
pub struct SimAdapter {
    venue: Venue,
    next_id: AtomicU64,
    /// Artificial call latency in milliseconds
    latency_ms: AtomicU64,
    state: Arc<Mutex<SimState>>,
}

impl SimAdapter {
    /// Create a sim venue
    #[must_use]
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            next_id: AtomicU64::new(1),
            latency_ms: AtomicU64::new(0),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Delay every adapter call by `ms`
    pub fn set_latency_ms(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
    }

    /// Queue a failure for the next adapter call
    pub fn fail_next(&self, error: AdapterError) {
        self.state.lock().fail_plan.push_back(error);
    }

    /// Whether a user stream consumer is attached
    #[must_use]
    pub fn user_stream_ready(&self) -> bool {
        self.state.lock().user_tx.is_some()
    }

    /// Venue order id assigned to a client order, if placed
    #[must_use]
    pub fn venue_id_of(&self, client_id: &ClientOrderId) -> Option<VenueOrderId> {
        self.state
            .lock()
            .orders
            .iter()
            .find(|(cid, _)| cid == client_id)
            .map(|(_, vid)| vid.clone())
    }

    /// Inject a fill onto the user stream
    pub fn feed_fill(&self, client_id: &ClientOrderId, qty: Qty, price: Px, fee: i64, ts: Ts) {
        let (vid, seq, tx) = {
            let mut state = self.state.lock();
            let Some(vid) = state
                .orders
                .iter()
                .find(|(cid, _)| cid == client_id)
                .map(|(_, v)| v.clone())
            else {
                return;
            };
            let seq = Self::bump_seq(&mut state, &vid);
            (vid, seq, state.user_tx.clone())
        };
        let fill = Fill {
            client_id: client_id.clone(),
            venue_order_id: vid.clone(),
            qty,
            price,
            fee,
            ts,
        };
        Self::send(tx, ExchangeEvent::Fill {
            venue_order_id: vid,
            fill,
            event_seq: seq,
        });
    }

    /// Inject a cancel ack onto the user stream
    pub fn feed_cancel_ack(&self, client_id: &ClientOrderId, ts: Ts) {
        let (vid, seq, tx) = {
            let mut state = self.state.lock();
            let Some(vid) = state
                .orders
                .iter()
                .find(|(cid, _)| cid == client_id)
                .map(|(_, v)| v.clone())
            else {
                return;
            };
            let seq = Self::bump_seq(&mut state, &vid);
            (vid, seq, state.user_tx.clone())
        };
        Self::send(tx, ExchangeEvent::CancelAck {
            venue_order_id: vid,
            event_seq: seq,
            ts,
        });
    }

    /// Inject a time-in-force expiry onto the user stream
    pub fn feed_expire(&self, client_id: &ClientOrderId, ts: Ts) {
        let (vid, seq, tx) = {
            let mut state = self.state.lock();
            let Some(vid) = state
                .orders
                .iter()
                .find(|(cid, _)| cid == client_id)
                .map(|(_, v)| v.clone())
            else {
                return;
            };
            let seq = Self::bump_seq(&mut state, &vid);
            (vid, seq, state.user_tx.clone())
        };
        Self::send(tx, ExchangeEvent::Expired {
            venue_order_id: vid,
            event_seq: seq,
            ts,
        });
    }

    fn bump_seq(state: &mut SimState, vid: &VenueOrderId) -> u64 {
        match state.event_seqs.iter_mut().find(|(v, _)| v == vid) {
            Some((_, seq)) => {
                *seq += 1;
                *seq
            }
            None => {
                // Seq 1 belongs to the placement ack.
                state.event_seqs.push((vid.clone(), 2));
                2
            }
        }
    }

    fn send(tx: Option<mpsc::Sender<ExchangeEvent>>, event: ExchangeEvent) {
        if let Some(tx) = tx {
            let _ = tx.try_send(event);
        }
    }

    fn take_scripted_failure(&self) -> Option<AdapterError> {
        self.state.lock().fail_plan.pop_front()
    }
}

#[async_trait]
impl ExchangeAdapter for SimAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck, AdapterError> {
        self.simulate_latency().await;
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let vid = VenueOrderId::new(format!("V{n}"));
        self.state
            .lock()
            .orders
            .push((req.client_id.clone(), vid.clone()));
        Ok(OrderAck {
            venue_order_id: vid,
            ts: Ts::from_nanos(0),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: Symbol,
        client_id: &ClientOrderId,
    ) -> Result<(), AdapterError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        if self.venue_id_of(client_id).is_none() {
            return Err(AdapterError::InvalidRequest(format!(
                "unknown order {client_id}"
            )));
        }
        Ok(())
    }

    async fn query_order(
        &self,
        _symbol: Symbol,
        client_id: &ClientOrderId,
    ) -> Result<OrderStatusReport, AdapterError> {
        let vid = self
            .venue_id_of(client_id)
            .ok_or_else(|| AdapterError::InvalidRequest(format!("unknown order {client_id}")))?;
        Ok(OrderStatusReport {
            client_id: client_id.clone(),
            venue_order_id: Some(vid),
            status: "OPEN".to_string(),
            exec_qty: Qty::ZERO,
            avg_price: Px::ZERO,
        })
    }

    async fn fetch_balances(&self) -> Result<Vec<Balance>, AdapterError> {
        Ok(vec![Balance {
            asset: "USDT".to_string(),
            free: Qty::parse("100000").expect("static literal"),
            locked: Qty::ZERO,
        }])
    }

    async fn subscribe_market(&self, _symbols: &[Symbol]) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn subscribe_user_stream(
        &self,
        tx: mpsc::Sender<ExchangeEvent>,
    ) -> Result<(), AdapterError> {
        self.state.lock().user_tx = Some(tx);
        Ok(())
    }
}
