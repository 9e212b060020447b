//! OMS lifecycle, reordering, parking and recovery

use common::config::{WalConfig, WalSyncMode};
use common::{
    ClientOrderId, EngineError, Fill, OrderType, PlaceOrderRequest, Px, Qty, Side, Symbol,
    TimeInForce, Ts, Venue, VenueOrderId,
};
use execution::adapter::ExchangeEvent;
use execution::oms::order::OrderState;
use execution::{OmsEvent, OrderManager};
use proptest::prelude::*;
use storage::Wal;

fn req(id: &str) -> PlaceOrderRequest {
    PlaceOrderRequest {
        client_id: ClientOrderId::new(id).unwrap(),
        venue: Venue::Binance,
        symbol: Symbol::new(1),
        side: Side::Buy,
        order_type: OrderType::Limit,
        price: Some(Px::parse("50000").unwrap()),
        qty: Qty::parse("0.001").unwrap(),
        tif: TimeInForce::Gtc,
        strategy_id: None,
    }
}

fn cid(id: &str) -> ClientOrderId {
    ClientOrderId::new(id).unwrap()
}

fn vid(id: &str) -> VenueOrderId {
    VenueOrderId::new(id)
}

fn ts(n: u64) -> Ts {
    Ts::from_nanos(n)
}

fn ack(client: &str, venue: &str, seq: u64, at: u64) -> ExchangeEvent {
    ExchangeEvent::Ack {
        client_id: cid(client),
        venue_order_id: vid(venue),
        event_seq: seq,
        ts: ts(at),
    }
}

fn fill_ev(client: &str, venue: &str, qty: &str, price: &str, seq: u64, at: u64) -> ExchangeEvent {
    ExchangeEvent::Fill {
        venue_order_id: vid(venue),
        fill: Fill {
            client_id: cid(client),
            venue_order_id: vid(venue),
            qty: Qty::parse(qty).unwrap(),
            price: Px::parse(price).unwrap(),
            fee: 0,
            ts: ts(at),
        },
        event_seq: seq,
    }
}

fn states(events: &[OmsEvent]) -> Vec<OrderState> {
    events
        .iter()
        .filter_map(|e| match e {
            OmsEvent::OrderUpdate { order } => Some(order.state),
            _ => None,
        })
        .collect()
}

#[test]
fn happy_path_limit_buy() {
    // Scenario: register -> submit -> accept carries the venue id.
    let mut oms = OrderManager::new(None);
    let events = oms.register_new(&req("c1"), ts(1)).unwrap();
    assert_eq!(states(&events), vec![OrderState::New]);

    let events = oms.mark_submitted(&cid("c1"), ts(2));
    assert_eq!(states(&events), vec![OrderState::Submitted]);

    let events = oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));
    assert_eq!(states(&events), vec![OrderState::Accepted]);

    let order = oms.query(&cid("c1")).unwrap();
    assert_eq!(order.venue_order_id, Some(vid("V1")));
}

#[test]
fn partial_then_full_fill() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));

    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.0004", "50000", 2, 4), ts(4));
    assert!(matches!(events[0], OmsEvent::FillRecorded { .. }));
    assert_eq!(states(&events), vec![OrderState::PartiallyFilled]);
    let order = oms.query(&cid("c1")).unwrap();
    assert_eq!(order.exec_qty, Qty::parse("0.0004").unwrap());

    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.0006", "49999", 3, 5), ts(5));
    assert_eq!(states(&events), vec![OrderState::Filled]);
    let order = oms.query(&cid("c1")).unwrap();
    assert_eq!(order.exec_qty, order.qty);
    assert_eq!(order.avg_price, Px::parse("49999.4").unwrap());

    // Position reflects both fills.
    let pos = oms.positions().get(Symbol::new(1));
    assert_eq!(pos.qty, Qty::parse("0.001").unwrap().as_i64());
}

#[test]
fn cancel_race_fill_wins() {
    // Scenario: cancel requested, fill lands before the ack; the order
    // completes and the late cancel ack changes nothing.
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));

    let events = oms.request_cancel(&cid("c1"), ts(4)).unwrap();
    assert_eq!(states(&events), vec![OrderState::CancelRequested]);

    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.001", "50000", 2, 5), ts(5));
    assert_eq!(states(&events), vec![OrderState::Filled]);

    // Late cancel ack: ignored, no state change.
    let events = oms.on_exchange_event(
        ExchangeEvent::CancelAck {
            venue_order_id: vid("V1"),
            event_seq: 3,
            ts: ts(6),
        },
        ts(6),
    );
    assert!(states(&events).is_empty());
    assert_eq!(oms.query(&cid("c1")).unwrap().state, OrderState::Filled);
}

#[test]
fn cancel_ack_completes_two_phase_cancel() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));
    oms.request_cancel(&cid("c1"), ts(4)).unwrap();

    let events = oms.on_exchange_event(
        ExchangeEvent::CancelAck {
            venue_order_id: vid("V1"),
            event_seq: 2,
            ts: ts(5),
        },
        ts(5),
    );
    assert_eq!(states(&events), vec![OrderState::Cancelled]);
}

#[test]
fn partial_fill_during_cancel_request_keeps_intent() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));
    oms.request_cancel(&cid("c1"), ts(4)).unwrap();

    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.0004", "50000", 2, 5), ts(5));
    // Execution progressed but the cancel intent is preserved.
    assert_eq!(states(&events), vec![OrderState::CancelRequested]);
    assert_eq!(
        oms.query(&cid("c1")).unwrap().exec_qty,
        Qty::parse("0.0004").unwrap()
    );

    let events = oms.on_exchange_event(
        ExchangeEvent::CancelAck {
            venue_order_id: vid("V1"),
            event_seq: 3,
            ts: ts(6),
        },
        ts(6),
    );
    assert_eq!(states(&events), vec![OrderState::Cancelled]);
}

#[test]
fn out_of_order_events_reorder_by_seq() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));

    // Seq 3 arrives before seq 2: buffered, nothing visible yet.
    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.0006", "49999", 3, 5), ts(5));
    assert!(events.is_empty());

    // Seq 2 arrives: both apply, in order.
    let events = oms.on_exchange_event(fill_ev("c1", "V1", "0.0004", "50000", 2, 4), ts(6));
    assert_eq!(
        states(&events),
        vec![OrderState::PartiallyFilled, OrderState::Filled]
    );
    assert_eq!(
        oms.query(&cid("c1")).unwrap().avg_price,
        Px::parse("49999.4").unwrap()
    );
}

#[test]
fn unknown_venue_id_parks_until_ack() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));

    // Fill arrives before the submit receipt: parked.
    let events = oms.on_exchange_event(fill_ev("c1", "V9", "0.001", "50000", 2, 3), ts(3));
    assert!(events.is_empty());
    assert_eq!(oms.query(&cid("c1")).unwrap().state, OrderState::Submitted);

    // Ack resolves the venue id; the parked fill replays.
    let events = oms.on_exchange_event(ack("c1", "V9", 1, 4), ts(4));
    assert_eq!(
        states(&events),
        vec![OrderState::Accepted, OrderState::Filled]
    );
}

#[test]
fn parked_events_dropped_after_ttl() {
    let mut oms = OrderManager::new(None);
    let events = oms.on_exchange_event(fill_ev("cx", "V404", "1", "100", 2, 1), ts(1));
    assert!(events.is_empty());

    // Inside the window: kept.
    assert!(oms.sweep_parked(ts(1_500_000_000)).is_empty());

    // Past 2s: dropped with an unknown-order error.
    let events = oms.sweep_parked(ts(3_100_000_000));
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        OmsEvent::OrderError {
            error: EngineError::UnknownOrder(_),
            ..
        }
    ));
}

#[test]
fn duplicate_client_id_collides() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    let err = oms.register_new(&req("c1"), ts(2)).unwrap_err();
    assert!(matches!(err, EngineError::IdCollision(_)));
}

#[test]
fn rejection_is_terminal() {
    let mut oms = OrderManager::new(None);
    oms.register_new(&req("c1"), ts(1)).unwrap();
    oms.mark_submitted(&cid("c1"), ts(2));
    let events = oms.on_exchange_event(
        ExchangeEvent::Reject {
            client_id: cid("c1"),
            code: "-2010".to_string(),
            msg: "insufficient balance".to_string(),
            ts: ts(3),
        },
        ts(3),
    );
    assert_eq!(states(&events), vec![OrderState::Rejected]);

    // Nothing moves a rejected order.
    let events = oms.on_exchange_event(ack("c1", "V1", 1, 4), ts(4));
    assert!(states(&events).is_empty());
    assert_eq!(oms.query(&cid("c1")).unwrap().state, OrderState::Rejected);
}

#[test]
fn wal_recovery_rebuilds_orders_and_positions() {
    // Scenario: journaled lifecycle, restart, identical state.
    let tmp = tempfile::TempDir::new().unwrap();
    let config = WalConfig {
        enabled: true,
        dir: tmp.path().to_string_lossy().into_owned(),
        sync_mode: WalSyncMode::Fsync,
        max_segment_bytes: 1024 * 1024,
        flush_interval_ms: 1_000,
    };

    let (final_order, final_pos) = {
        let (wal, _) = Wal::open(&config).unwrap();
        let mut oms = OrderManager::new(Some(wal));
        oms.register_new(&req("c1"), ts(1)).unwrap();
        oms.mark_submitted(&cid("c1"), ts(2));
        oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));
        oms.on_exchange_event(fill_ev("c1", "V1", "0.0004", "50000", 2, 4), ts(4));
        oms.on_exchange_event(fill_ev("c1", "V1", "0.0006", "49999", 3, 5), ts(5));
        oms.flush_wal().unwrap();
        (
            oms.query(&cid("c1")).unwrap(),
            oms.positions().get(Symbol::new(1)),
        )
    };

    // Restart: replay the journal into a fresh manager.
    let (wal, recovery) = Wal::open(&config).unwrap();
    let mut oms = OrderManager::new(Some(wal));
    oms.recover(&recovery).unwrap();

    let order = oms.query(&cid("c1")).unwrap();
    assert_eq!(order.state, final_order.state);
    assert_eq!(order.exec_qty, final_order.exec_qty);
    assert_eq!(order.avg_price, final_order.avg_price);
    assert_eq!(order.venue_order_id, final_order.venue_order_id);

    let pos = oms.positions().get(Symbol::new(1));
    assert_eq!(pos.qty, final_pos.qty);
    assert_eq!(pos.avg_entry, final_pos.avg_entry);
    assert_eq!(pos.realized_pnl, final_pos.realized_pnl);
}

#[test]
fn checkpoint_then_recover() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = WalConfig {
        enabled: true,
        dir: tmp.path().to_string_lossy().into_owned(),
        sync_mode: WalSyncMode::Fsync,
        max_segment_bytes: 1024 * 1024,
        flush_interval_ms: 1_000,
    };

    {
        let (wal, _) = Wal::open(&config).unwrap();
        let mut oms = OrderManager::new(Some(wal));
        oms.register_new(&req("c1"), ts(1)).unwrap();
        oms.mark_submitted(&cid("c1"), ts(2));
        oms.on_exchange_event(ack("c1", "V1", 1, 3), ts(3));
        oms.on_exchange_event(fill_ev("c1", "V1", "0.001", "50000", 2, 4), ts(4));
        oms.checkpoint(ts(5)).unwrap();
        // Post-checkpoint activity.
        oms.register_new(&req("c2"), ts(6)).unwrap();
        oms.flush_wal().unwrap();
    }

    let (wal, recovery) = Wal::open(&config).unwrap();
    let mut oms = OrderManager::new(Some(wal));
    oms.recover(&recovery).unwrap();
    assert_eq!(oms.query(&cid("c1")).unwrap().state, OrderState::Filled);
    assert_eq!(oms.query(&cid("c2")).unwrap().state, OrderState::New);
}

// Property: no fuzzed event sequence produces a transition outside the
// state machine graph, and terminal states absorb everything after them.
#[derive(Debug, Clone)]
enum FuzzOp {
    Submit,
    Ack,
    PartialFill,
    FullFill,
    CancelReq,
    CancelAck,
    Reject,
    Expire,
}

fn arb_op() -> impl Strategy<Value = FuzzOp> {
    prop_oneof![
        Just(FuzzOp::Submit),
        Just(FuzzOp::Ack),
        Just(FuzzOp::PartialFill),
        Just(FuzzOp::FullFill),
        Just(FuzzOp::CancelReq),
        Just(FuzzOp::CancelAck),
        Just(FuzzOp::Reject),
        Just(FuzzOp::Expire),
    ]
}

fn legal(from: OrderState, to: OrderState) -> bool {
    use OrderState::*;
    match from {
        New => matches!(to, Submitted | Rejected),
        Submitted => matches!(to, Accepted | Rejected),
        Accepted => matches!(
            to,
            PartiallyFilled | Filled | CancelRequested | Cancelled | Expired
        ),
        PartiallyFilled => matches!(
            to,
            PartiallyFilled | Filled | CancelRequested | Cancelled | Expired
        ),
        CancelRequested => matches!(to, Cancelled | PartiallyFilled | Filled | CancelRequested),
        Filled | Cancelled | Rejected | Expired => false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]
    #[test]
    fn fuzzed_sequences_stay_inside_the_graph(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut oms = OrderManager::new(None);
        oms.register_new(&req("c1"), ts(0)).unwrap();
        let mut last_state = OrderState::New;
        let mut seq = 1_u64;

        for (i, op) in ops.iter().enumerate() {
            let at = ts(i as u64 + 1);
            let events = match op {
                FuzzOp::Submit => oms.mark_submitted(&cid("c1"), at),
                FuzzOp::Ack => {
                    seq = 2;
                    oms.on_exchange_event(ack("c1", "V1", 1, i as u64), at)
                }
                FuzzOp::PartialFill => {
                    let e = oms.on_exchange_event(
                        fill_ev("c1", "V1", "0.0001", "50000", seq, i as u64),
                        at,
                    );
                    if !e.is_empty() { seq += 1; }
                    e
                }
                FuzzOp::FullFill => {
                    let remaining = oms
                        .query(&cid("c1"))
                        .map(|o| o.remaining())
                        .unwrap_or(Qty::ZERO);
                    if remaining.is_zero() {
                        continue;
                    }
                    let e = oms.on_exchange_event(
                        ExchangeEvent::Fill {
                            venue_order_id: vid("V1"),
                            fill: Fill {
                                client_id: cid("c1"),
                                venue_order_id: vid("V1"),
                                qty: remaining,
                                price: Px::parse("50000").unwrap(),
                                fee: 0,
                                ts: at,
                            },
                            event_seq: seq,
                        },
                        at,
                    );
                    if !e.is_empty() { seq += 1; }
                    e
                }
                FuzzOp::CancelReq => oms.request_cancel(&cid("c1"), at).unwrap_or_default(),
                FuzzOp::CancelAck => {
                    let e = oms.on_exchange_event(
                        ExchangeEvent::CancelAck {
                            venue_order_id: vid("V1"),
                            event_seq: seq,
                            ts: at,
                        },
                        at,
                    );
                    if !e.is_empty() { seq += 1; }
                    e
                }
                FuzzOp::Reject => oms.on_exchange_event(
                    ExchangeEvent::Reject {
                        client_id: cid("c1"),
                        code: "x".to_string(),
                        msg: "fuzz".to_string(),
                        ts: at,
                    },
                    at,
                ),
                FuzzOp::Expire => {
                    let e = oms.on_exchange_event(
                        ExchangeEvent::Expired {
                            venue_order_id: vid("V1"),
                            event_seq: seq,
                            ts: at,
                        },
                        at,
                    );
                    if !e.is_empty() { seq += 1; }
                    e
                }
            };

            for event in &events {
                if let OmsEvent::OrderUpdate { order } = event {
                    let to = order.state;
                    if to != last_state {
                        prop_assert!(
                            legal(last_state, to),
                            "illegal transition {:?} -> {:?}",
                            last_state,
                            to
                        );
                        last_state = to;
                    }
                }
            }

            // Terminal states must absorb: state never changes after.
            if last_state.is_terminal() {
                let frozen = oms.query(&cid("c1")).unwrap().state;
                prop_assert_eq!(frozen, last_state);
            }
        }
    }
}
