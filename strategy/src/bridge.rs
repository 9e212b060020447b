//! Signal to order bridge
//!
//! For each pulled signal: risk-check the intent, allocate a client id,
//! build the order request for the router, and stamp submission time
//! for latency metrics. Failures become typed outcomes; the owning
//! strategy hears about them via `on_position_update` only after the
//! OMS has been updated.

use crate::Signal;
use common::metrics::MetricsRegistry;
use common::{EngineError, OrderIntent, PlaceOrderRequest, Symbol, Ts, Venue};
use execution::IdAllocator;
use risk::RiskEngine;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Result of pushing one signal through the bridge
#[derive(Debug)]
pub enum BridgeOutcome {
    /// Risk passed; the request is ready for the router
    Accepted(PlaceOrderRequest),
    /// Risk rejected the intent
    Rejected {
        /// Strategy that emitted the signal
        strategy_id: String,
        /// The rejection
        error: EngineError,
    },
}

/// The bridge
pub struct SignalBridge {
    risk: Arc<RiskEngine>,
    ids: Arc<IdAllocator>,
    /// Venue per symbol, from market configuration
    venues: FxHashMap<Symbol, Venue>,
    metrics: Arc<MetricsRegistry>,
}

impl SignalBridge {
    /// Create a bridge
    #[must_use]
    pub fn new(
        risk: Arc<RiskEngine>,
        ids: Arc<IdAllocator>,
        venues: FxHashMap<Symbol, Venue>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            risk,
            ids,
            venues,
            metrics,
        }
    }

    /// Process one signal
    pub fn process(&self, strategy_id: &str, signal: &Signal, now: Ts) -> BridgeOutcome {
        let intent = OrderIntent {
            symbol: signal.symbol,
            side: signal.side,
            order_type: signal.order_type,
            price: signal.price,
            qty: signal.qty,
        };

        if let Err(error) = self.risk.check(&intent, now) {
            self.metrics.counter("bridge_risk_rejected_total").inc();
            debug!(strategy = strategy_id, error = %error, "signal rejected by risk");
            return BridgeOutcome::Rejected {
                strategy_id: strategy_id.to_string(),
                error,
            };
        }

        let client_id = self.ids.next();
        let venue = self
            .venues
            .get(&signal.symbol)
            .copied()
            .unwrap_or(Venue::Binance);
        self.metrics.counter("bridge_signals_accepted_total").inc();

        BridgeOutcome::Accepted(PlaceOrderRequest {
            client_id,
            venue,
            symbol: signal.symbol,
            side: signal.side,
            order_type: signal.order_type,
            price: signal.price,
            qty: signal.qty,
            tif: signal.tif,
            strategy_id: Some(strategy_id.to_string()),
        })
    }

    /// Record signal-to-submit latency after the router call completes
    pub fn record_submit_latency(&self, signal_ts: Ts, submitted_ts: Ts) {
        let us = submitted_ts.saturating_sub(signal_ts) / 1_000;
        self.metrics
            .histogram("bridge_signal_to_submit_us")
            .record_micros(us.max(1));
    }
}
