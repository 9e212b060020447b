//! Subscription registry and fan-out
//!
//! Many-to-many routing from `(venue, symbol, stream kind)` to consumer
//! callbacks. Consumers hold only ids; callbacks live in the registry and
//! run on the market dispatcher, so they must never block. Paused
//! subscriptions skip dispatch but keep their registration.

use common::{MarketEvent, StreamKind, Symbol, Venue};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Registry-assigned subscription identifier
pub type SubscriptionId = u64;

/// Subscription lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, awaiting feed confirmation
    Requested,
    /// Receiving events
    Active,
    /// Registered but not receiving events
    Paused,
    /// Terminated; kept only until swept
    Cancelled,
}

/// Consumer callback invoked on the market dispatcher
pub type ConsumerCallback = Box<dyn FnMut(&MarketEvent) + Send>;

type StreamKey = (Venue, Symbol, StreamKind);

struct Subscription {
    key: StreamKey,
    state: SubscriptionState,
    callback: ConsumerCallback,
}

/// Symbol/stream to consumer routing table
#[derive(Default)]
pub struct SubscriptionManager {
    next_id: SubscriptionId,
    subs: FxHashMap<SubscriptionId, Subscription>,
    index: FxHashMap<StreamKey, Vec<SubscriptionId>>,
}

impl SubscriptionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for a stream; starts in `Requested`
    pub fn subscribe(
        &mut self,
        venue: Venue,
        symbol: Symbol,
        kind: StreamKind,
        callback: ConsumerCallback,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        let key = (venue, symbol, kind);
        self.subs.insert(
            id,
            Subscription {
                key,
                state: SubscriptionState::Requested,
                callback,
            },
        );
        self.index.entry(key).or_default().push(id);
        debug!(id, venue = %venue, symbol = %symbol, "subscription registered");
        id
    }

    /// Mark a requested or paused subscription active
    pub fn activate(&mut self, id: SubscriptionId) -> bool {
        match self.subs.get_mut(&id) {
            Some(sub) if sub.state != SubscriptionState::Cancelled => {
                sub.state = SubscriptionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Pause dispatch without dropping the registration
    pub fn pause(&mut self, id: SubscriptionId) -> bool {
        match self.subs.get_mut(&id) {
            Some(sub) if sub.state == SubscriptionState::Active => {
                sub.state = SubscriptionState::Paused;
                true
            }
            _ => false,
        }
    }

    /// Cancel and unregister
    pub fn cancel(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subs.get_mut(&id) else {
            return false;
        };
        sub.state = SubscriptionState::Cancelled;
        let key = sub.key;
        if let Some(ids) = self.index.get_mut(&key) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.index.remove(&key);
            }
        }
        self.subs.remove(&id);
        true
    }

    /// State of a subscription, if registered
    #[must_use]
    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.subs.get(&id).map(|s| s.state)
    }

    /// Whether any consumer is registered for a stream
    #[must_use]
    pub fn has_consumers(&self, venue: Venue, symbol: Symbol, kind: StreamKind) -> bool {
        self.index.contains_key(&(venue, symbol, kind))
    }

    /// Fan an event out to every active consumer of its stream
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&mut self, event: &MarketEvent) -> usize {
        let key = (event.venue, event.symbol, event.payload.kind());
        let Some(ids) = self.index.get(&key) else {
            return 0;
        };
        // Ids are copied out so callbacks can re-enter the manager later.
        let ids: Vec<SubscriptionId> = ids.clone();
        let mut delivered = 0;
        for id in ids {
            if let Some(sub) = self.subs.get_mut(&id) {
                if sub.state == SubscriptionState::Active {
                    (sub.callback)(event);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Number of live (non-cancelled) subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MarketPayload, Px, Qty, Side, TradeEvent, Ts};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn trade_event(symbol: Symbol) -> MarketEvent {
        MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq: 1,
            ts_exchange: Ts::from_nanos(1),
            ts_recv: Ts::from_nanos(2),
            payload: MarketPayload::Trade(TradeEvent {
                price: Px::from_i64(100),
                qty: Qty::from_i64(1),
                side: Side::Buy,
            }),
        }
    }

    fn counting_callback() -> (Arc<AtomicUsize>, ConsumerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn only_active_subscriptions_receive() {
        let mut mgr = SubscriptionManager::new();
        let sym = Symbol::new(1);
        let (count, cb) = counting_callback();
        let id = mgr.subscribe(Venue::Binance, sym, StreamKind::Trade, cb);

        // Requested: no dispatch yet.
        assert_eq!(mgr.dispatch(&trade_event(sym)), 0);
        assert_eq!(mgr.state(id), Some(SubscriptionState::Requested));

        mgr.activate(id);
        assert_eq!(mgr.dispatch(&trade_event(sym)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        mgr.pause(id);
        assert_eq!(mgr.dispatch(&trade_event(sym)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        mgr.activate(id);
        assert_eq!(mgr.dispatch(&trade_event(sym)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fan_out_to_multiple_consumers() {
        let mut mgr = SubscriptionManager::new();
        let sym = Symbol::new(1);
        let (c1, cb1) = counting_callback();
        let (c2, cb2) = counting_callback();
        let id1 = mgr.subscribe(Venue::Binance, sym, StreamKind::Trade, cb1);
        let id2 = mgr.subscribe(Venue::Binance, sym, StreamKind::Trade, cb2);
        mgr.activate(id1);
        mgr.activate(id2);

        assert_eq!(mgr.dispatch(&trade_event(sym)), 2);
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn routing_respects_symbol_and_kind() {
        let mut mgr = SubscriptionManager::new();
        let (count, cb) = counting_callback();
        let id = mgr.subscribe(Venue::Binance, Symbol::new(1), StreamKind::Depth, cb);
        mgr.activate(id);

        // Trade event does not reach a depth consumer.
        assert_eq!(mgr.dispatch(&trade_event(Symbol::new(1))), 0);
        // Different symbol does not reach it either.
        assert_eq!(mgr.dispatch(&trade_event(Symbol::new(2))), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_unregisters() {
        let mut mgr = SubscriptionManager::new();
        let sym = Symbol::new(1);
        let (count, cb) = counting_callback();
        let id = mgr.subscribe(Venue::Binance, sym, StreamKind::Trade, cb);
        mgr.activate(id);
        assert!(mgr.has_consumers(Venue::Binance, sym, StreamKind::Trade));

        assert!(mgr.cancel(id));
        assert!(!mgr.has_consumers(Venue::Binance, sym, StreamKind::Trade));
        assert_eq!(mgr.dispatch(&trade_event(sym)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(mgr.is_empty());

        // Cancelled ids are inert.
        assert!(!mgr.activate(id));
        assert!(!mgr.cancel(id));
    }
}
