//! Order router
//!
//! Wraps every adapter call with, in order: venue-disable check (auth
//! death), per-client-id dedup, circuit-breaker admission, token-bucket
//! rate limiting, deadline enforcement, retry policy (Network/Timeout/
//! RateLimited only) and per-venue latency histograms. At-most-once
//! externalization per client id per call is guaranteed by idempotent
//! ids plus local de-duplication of concurrent calls.

use crate::adapter::{AdapterError, ExchangeAdapter, OrderAck};
use crate::rate_limit::TokenBucket;
use common::config::{RouterConfig, VenueRouterConfig};
use common::metrics::MetricsRegistry;
use common::{ClientOrderId, EngineError, PlaceOrderRequest, Symbol, Venue};
use dashmap::DashMap;
use parking_lot::Mutex;
use risk::{Admission, BreakerRegistry};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// The order router
pub struct OrderRouter {
    adapters: FxHashMap<Venue, Arc<dyn ExchangeAdapter>>,
    buckets: FxHashMap<Venue, Mutex<TokenBucket>>,
    configs: FxHashMap<Venue, VenueRouterConfig>,
    config: RouterConfig,
    breakers: Arc<BreakerRegistry>,
    in_flight: DashMap<ClientOrderId, ()>,
    cancels_in_flight: DashMap<ClientOrderId, ()>,
    disabled: DashMap<Venue, ()>,
    metrics: Arc<MetricsRegistry>,
}

impl OrderRouter {
    /// Build a router over the configured adapters
    #[must_use]
    pub fn new(
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
        config: RouterConfig,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let mut adapter_map = FxHashMap::default();
        let mut buckets = FxHashMap::default();
        let mut configs = FxHashMap::default();
        for adapter in adapters {
            let venue = adapter.venue();
            let vc = config.venue(venue);
            buckets.insert(
                venue,
                Mutex::new(TokenBucket::new(vc.rate_capacity, vc.rate_refill_per_sec)),
            );
            configs.insert(venue, vc);
            adapter_map.insert(venue, adapter);
        }
        Self {
            adapters: adapter_map,
            buckets,
            configs,
            config,
            breakers,
            in_flight: DashMap::new(),
            cancels_in_flight: DashMap::new(),
            disabled: DashMap::new(),
            metrics,
        }
    }

    /// Whether a venue is still routable
    #[must_use]
    pub fn venue_enabled(&self, venue: Venue) -> bool {
        !self.disabled.contains_key(&venue)
    }

    /// Place an order at its configured venue
    pub async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck, EngineError> {
        let venue = req.venue;
        if self.in_flight.insert(req.client_id.clone(), ()).is_some() {
            return Err(EngineError::IdCollision(req.client_id.to_string()));
        }
        let result = self
            .call(venue, "place", || async {
                let adapter = self.adapter(venue)?;
                self.with_deadline(venue, adapter.place_order(req)).await
            })
            .await;
        self.in_flight.remove(&req.client_id);
        result
    }

    /// Cancel an order at its venue
    pub async fn cancel_order(
        &self,
        venue: Venue,
        symbol: Symbol,
        client_id: &ClientOrderId,
    ) -> Result<(), EngineError> {
        if self
            .cancels_in_flight
            .insert(client_id.clone(), ())
            .is_some()
        {
            debug!(order = %client_id, "duplicate concurrent cancel suppressed");
            return Ok(());
        }
        let result = self
            .call(venue, "cancel", || async {
                let adapter = self.adapter(venue)?;
                self.with_deadline(venue, adapter.cancel_order(symbol, client_id))
                    .await
            })
            .await;
        self.cancels_in_flight.remove(client_id);
        result
    }

    fn adapter(&self, venue: Venue) -> Result<&Arc<dyn ExchangeAdapter>, AdapterError> {
        self.adapters
            .get(&venue)
            .ok_or_else(|| AdapterError::InvalidRequest(format!("no adapter for {venue}")))
    }

    async fn with_deadline<T>(
        &self,
        venue: Venue,
        fut: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        let timeout = Duration::from_millis(
            self.configs
                .get(&venue)
                .map_or(5_000, |c| c.request_timeout_ms),
        );
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(format!(
                "deadline {timeout:?} exceeded"
            ))),
        }
    }

    /// Shared resilience wrapper for place and cancel
    async fn call<T, F, Fut>(&self, venue: Venue, op: &str, mut attempt_fn: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        if !self.venue_enabled(venue) {
            return Err(EngineError::Auth(format!("venue {venue} disabled")));
        }

        let breaker = self.breakers.get(venue);
        if let Some(breaker) = breaker {
            match breaker.admit() {
                Admission::Reject => {
                    self.metrics
                        .counter(&format!("router_{op}_circuit_rejected_total"))
                        .inc();
                    return Err(EngineError::CircuitOpen {
                        venue: venue.to_string(),
                    });
                }
                Admission::Probe => {
                    debug!(venue = %venue, op, "routing circuit probe");
                }
                Admission::Proceed => {}
            }
        }

        self.acquire_token(venue).await;

        let max_retries = self.configs.get(&venue).map_or(0, |c| c.max_retries);
        let mut attempt = 0_u32;
        loop {
            let started = Instant::now();
            let result = attempt_fn().await;
            let elapsed_us = started.elapsed().as_micros() as u64;
            self.metrics
                .histogram(&format!("router_{op}_rtt_us_{venue}"))
                .record_micros(elapsed_us.max(1));

            match result {
                Ok(value) => {
                    if let Some(breaker) = breaker {
                        breaker.on_success();
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(breaker) = breaker {
                        breaker.on_failure();
                    }
                    if matches!(err, AdapterError::Auth(_)) {
                        error!(venue = %venue, error = %err, "auth failure; disabling venue");
                        self.disabled.insert(venue, ());
                        return Err(map_adapter_error(err));
                    }
                    if err.is_retryable() && attempt < max_retries {
                        let delay = match &err {
                            AdapterError::RateLimited { retry_after } => {
                                (*retry_after).max(self.config.retry.delay(attempt))
                            }
                            _ => self.config.retry.delay(attempt),
                        };
                        warn!(
                            venue = %venue,
                            op,
                            attempt,
                            error = %err,
                            ?delay,
                            "retrying adapter call"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    self.metrics
                        .counter(&format!("router_{op}_failed_total"))
                        .inc();
                    return Err(map_adapter_error(err));
                }
            }
        }
    }

    async fn acquire_token(&self, venue: Venue) {
        loop {
            let wait_ms = {
                let Some(bucket) = self.buckets.get(&venue) else {
                    return;
                };
                let mut bucket = bucket.lock();
                if bucket.try_acquire() {
                    return;
                }
                bucket.wait_hint_ms().min(50).max(1)
            };
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }
}

/// Map adapter failures onto the engine taxonomy
fn map_adapter_error(err: AdapterError) -> EngineError {
    match err {
        AdapterError::RateLimited { retry_after } => EngineError::RateLimited {
            retry_after_ms: retry_after.as_millis() as u64,
        },
        AdapterError::Network(msg) => EngineError::Network(msg),
        AdapterError::Auth(msg) => EngineError::Auth(msg),
        AdapterError::InvalidRequest(msg) => EngineError::ExchangeReject {
            code: "invalid_request".to_string(),
            msg,
        },
        AdapterError::ExchangeReject { code, msg } => EngineError::ExchangeReject { code, msg },
        AdapterError::Timeout(msg) => EngineError::Timeout(msg),
    }
}
