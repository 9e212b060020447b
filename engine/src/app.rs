//! Engine assembly and wiring
//!
//! Two dispatcher threads own the hot paths: the market dispatcher runs
//! books, aggregation, quality detection and strategies; the order
//! dispatcher runs the OMS, positions and risk-state updates. A tokio
//! runtime hosts blocking I/O (WebSocket, REST, adapter calls). All
//! cross-thread handoff goes through the runtime queues.

use crate::events::{EventEmitter, OutEvent, PositionJson, stamp};
use crate::stdio::{Command, parse_line};
use common::config::{EngineConfig, EnvOverrides, WalSyncMode};
use common::metrics::MetricsRegistry;
use common::{
    BookTop, ClientOrderId, KlineData, MarketEvent, MarketPayload, OrderType, PlaceOrderRequest,
    Px, Qty, StreamKind, Symbol, SymbolRegistry, TimeInForce, Ts, Venue, clock,
};
use dashmap::DashMap;
use execution::adapter::ExchangeEvent;
use execution::oms::OmsEvent;
use execution::oms::order::OrderState;
use execution::{ExchangeAdapter, IdAllocator, OrderManager, OrderRouter, SimAdapter};
use feeds::{
    BinanceDecoder, BinanceEndpoints, FeedMessage, KlineService, QualityConfig, QualityDetector,
    SubscriptionId, SubscriptionManager, WsClient, WsClientConfig,
};
use lob::{ApplyOutcome, OrderBook};
use parking_lot::Mutex;
use risk::{BreakerRegistry, RiskEngine};
use runtime::{EventLoop, EventLoopConfig, EventLoopHandle, Priority};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use storage::Wal;
use strategy::runtime::StrategyFailure;
use strategy::{BridgeOutcome, ExecutionUpdate, Signal, SignalBridge, StrategyRuntime, builtin};
use tracing::{error, info, warn};

/// Market-dispatcher-owned state
struct MarketHub {
    registry: Arc<SymbolRegistry>,
    books: FxHashMap<Symbol, OrderBook>,
    subs: SubscriptionManager,
    strategy_subs: FxHashMap<String, Vec<SubscriptionId>>,
    delivery: Arc<Mutex<Vec<String>>>,
    klines: KlineService,
    quality: QualityDetector,
    strategies: StrategyRuntime,
    tops: Arc<DashMap<Symbol, BookTop>>,
    emitter: EventEmitter,
    risk: Arc<RiskEngine>,
    /// Forwards mid marks to the order dispatcher for unrealized P&L
    mark_hook: Option<Box<dyn Fn(Symbol, Px) + Send>>,
}

impl MarketHub {
    fn mark(&self, symbol: Symbol, mid: Px) {
        self.risk.on_mark(symbol, mid);
        if let Some(hook) = &self.mark_hook {
            hook(symbol, mid);
        }
    }

    /// Register a strategy's subscriptions and activate them
    fn subscribe_strategy(&mut self, strategy_id: &str, symbol: Symbol, venue: Venue) {
        let mut ids = Vec::new();
        for kind in [StreamKind::Trade, StreamKind::Kline, StreamKind::Ticker] {
            let delivery = Arc::clone(&self.delivery);
            let sid = strategy_id.to_string();
            let id = self
                .subs
                .subscribe(venue, symbol, kind, Box::new(move |_event| {
                    delivery.lock().push(sid.clone());
                }));
            self.subs.activate(id);
            ids.push(id);
        }
        self.strategy_subs.insert(strategy_id.to_string(), ids);
    }

    /// Cancel a failed or stopped strategy's subscriptions
    fn isolate_strategy(&mut self, failure: &StrategyFailure) {
        if let Some(ids) = self.strategy_subs.remove(&failure.id) {
            for id in ids {
                self.subs.cancel(id);
            }
        }
        self.strategies.stop(&failure.id);
        let (ts_ns, ts_iso) = stamp(clock::now());
        self.emitter.emit(OutEvent::Error {
            ts_ns,
            ts_iso,
            code: "internal".to_string(),
            message: format!("strategy {} isolated: {}", failure.id, failure.error),
            client_order_id: None,
        });
    }

    fn symbol_name(&self, symbol: Symbol) -> String {
        self.registry
            .name(symbol)
            .unwrap_or_else(|| symbol.to_string())
    }

    /// Fan one event out through the subscription registry
    fn dispatch_to_strategies(&mut self, event: &MarketEvent) {
        self.delivery.lock().clear();
        self.subs.dispatch(event);
        let targets: Vec<String> = self.delivery.lock().drain(..).collect();
        for strategy_id in targets {
            if let Some(failure) = self.strategies.deliver(&strategy_id, event) {
                self.isolate_strategy(&failure);
            }
        }
    }

    /// Emit a closed candle and route it to subscribers
    fn publish_kline(&mut self, symbol: Symbol, candle: &KlineData) {
        let (ts_ns, ts_iso) = stamp(candle.open_time);
        self.emitter.emit(OutEvent::Market {
            ts_ns,
            ts_iso,
            symbol: self.symbol_name(symbol),
            kind: "kline".to_string(),
            data: serde_json::json!({
                "period_ms": candle.period_ms,
                "open": candle.open.to_decimal_string(),
                "high": candle.high.to_decimal_string(),
                "low": candle.low.to_decimal_string(),
                "close": candle.close.to_decimal_string(),
                "volume": candle.volume.to_decimal_string(),
                "vwap": candle.vwap.to_decimal_string(),
                "trades": candle.trades,
            }),
        });

        let venue = self
            .registry
            .instrument(symbol)
            .map_or(Venue::Binance, |i| i.venue);
        let event = MarketEvent {
            symbol,
            venue,
            seq: 0,
            ts_exchange: candle.open_time,
            ts_recv: clock::now(),
            payload: MarketPayload::Kline(*candle),
        };
        self.dispatch_to_strategies(&event);
    }

    /// Process one normalized market event; returns pulled signals
    fn handle_feed_event(&mut self, event: &MarketEvent) -> Vec<(String, Signal)> {
        let now = clock::now();

        match &event.payload {
            MarketPayload::BookSnapshot(snapshot) => {
                let book = self
                    .books
                    .entry(event.symbol)
                    .or_insert_with(|| OrderBook::new(event.symbol));
                if let Err(e) = book.apply_snapshot(snapshot, event.ts_recv) {
                    warn!(symbol = %event.symbol, error = %e, "snapshot rejected");
                }
                self.publish_top(event.symbol, now);
            }
            MarketPayload::BookDelta(deltas) => {
                let book = self
                    .books
                    .entry(event.symbol)
                    .or_insert_with(|| OrderBook::new(event.symbol));
                match book.apply_deltas(event.seq, deltas, event.ts_recv) {
                    Ok(ApplyOutcome::Applied) => self.publish_top(event.symbol, now),
                    Ok(ApplyOutcome::GapDetected { expected, got }) => {
                        // The feed layer re-snapshots; the book buffers.
                        warn!(symbol = %event.symbol, expected, got, "book sequence gap");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(symbol = %event.symbol, error = %e, "book update failed"),
                }
            }
            MarketPayload::Trade(trade) => {
                let (ts_ns, ts_iso) = stamp(event.ts_recv);
                self.emitter.emit(OutEvent::Market {
                    ts_ns,
                    ts_iso,
                    symbol: self.symbol_name(event.symbol),
                    kind: "trade".to_string(),
                    data: serde_json::json!({
                        "price": trade.price.to_decimal_string(),
                        "qty": trade.qty.to_decimal_string(),
                        "side": trade.side.to_string(),
                    }),
                });

                let closed =
                    self.klines
                        .on_trade(event.symbol, event.ts_exchange, trade.price, trade.qty);
                for candle in closed {
                    self.publish_kline(event.symbol, &candle);
                }
                let anomalies =
                    self.quality
                        .on_trade(event.symbol, trade.price, trade.qty, event.ts_recv);
                for anomaly in anomalies {
                    self.emit_anomaly(&anomaly);
                }
            }
            MarketPayload::Ticker(ticker) => {
                let top = BookTop {
                    bid: ticker.bid,
                    ask: ticker.ask,
                    ts: event.ts_recv,
                };
                self.tops.insert(event.symbol, top);
                if let Some(mid) = top.mid() {
                    self.mark(event.symbol, mid);
                }
            }
            MarketPayload::Kline(_) => {}
        }

        self.dispatch_to_strategies(event);
        self.strategies.collect_signals()
    }

    /// Timer sweep: close idle klines, tick strategies, pull signals
    fn handle_timer(&mut self, now: Ts) -> Vec<(String, Signal)> {
        for (symbol, candle) in self.klines.on_timer(now) {
            self.publish_kline(symbol, &candle);
        }
        for failure in self.strategies.on_timer(now) {
            self.isolate_strategy(&failure);
        }
        self.strategies.collect_signals()
    }

    fn publish_top(&mut self, symbol: Symbol, now: Ts) {
        let Some(book) = self.books.get(&symbol) else {
            return;
        };
        if !book.is_valid() {
            return;
        }
        let top = book.top();
        let changed = self
            .tops
            .get(&symbol)
            .map_or(true, |prev| prev.bid != top.bid || prev.ask != top.ask);
        if !changed {
            return;
        }
        self.tops.insert(symbol, top);

        if let Some(mid) = top.mid() {
            self.mark(symbol, mid);
        }
        let anomalies = self.quality.on_top(symbol, &top);
        for anomaly in anomalies {
            self.emit_anomaly(&anomaly);
        }

        let fmt_px = |v: Option<(Px, Qty)>| v.map(|(p, _)| p.to_decimal_string());
        let fmt_qty = |v: Option<(Px, Qty)>| v.map(|(_, q)| q.to_decimal_string());
        let (ts_ns, ts_iso) = stamp(now);
        self.emitter.emit(OutEvent::BookTop {
            ts_ns,
            ts_iso,
            symbol: self.symbol_name(symbol),
            bid: fmt_px(top.bid),
            bid_qty: fmt_qty(top.bid),
            ask: fmt_px(top.ask),
            ask_qty: fmt_qty(top.ask),
        });
    }

    fn emit_anomaly(&self, anomaly: &feeds::Anomaly) {
        let (ts_ns, ts_iso) = stamp(anomaly.ts);
        self.emitter.emit(OutEvent::Market {
            ts_ns,
            ts_iso,
            symbol: self.symbol_name(anomaly.symbol),
            kind: "anomaly".to_string(),
            data: serde_json::json!({
                "class": anomaly.kind,
                "severity": anomaly.severity,
            }),
        });
    }
}

/// Order-dispatcher-owned state
struct OrderHub {
    oms: OrderManager,
    risk: Arc<RiskEngine>,
    emitter: EventEmitter,
    registry: Arc<SymbolRegistry>,
    /// Realized P&L at the last publish, for delta reporting to risk
    last_realized: i64,
}

impl OrderHub {
    /// Translate OMS events to stdout events plus strategy feedback
    fn publish(&mut self, events: Vec<OmsEvent>) -> Vec<ExecutionUpdate> {
        let mut updates = Vec::new();
        for event in events {
            match event {
                OmsEvent::OrderUpdate { order } => {
                    // `order_received` covers the New state on stdout.
                    if order.state != OrderState::New {
                        let (ts_ns, ts_iso) = stamp(order.updated_ts);
                        self.emitter.emit(OutEvent::OrderUpdate {
                            ts_ns,
                            ts_iso,
                            client_order_id: order.client_id.to_string(),
                            state: order.state.as_str().to_string(),
                            venue_order_id: order.venue_order_id.as_ref().map(ToString::to_string),
                            exec_qty: order.exec_qty.to_decimal_string(),
                            avg_price: order.avg_price.to_decimal_string(),
                        });
                    }
                    updates.push(ExecutionUpdate::OrderState {
                        client_id: order.client_id.clone(),
                        state: order.state.as_str().to_string(),
                        strategy_id: order.strategy_id.clone(),
                    });
                }
                OmsEvent::FillRecorded { fill, position } => {
                    let (ts_ns, ts_iso) = stamp(fill.ts);
                    self.emitter.emit(OutEvent::Fill {
                        ts_ns,
                        ts_iso,
                        client_order_id: fill.client_id.to_string(),
                        venue_order_id: fill.venue_order_id.to_string(),
                        qty: fill.qty.to_decimal_string(),
                        price: fill.price.to_decimal_string(),
                        fee: fill.fee,
                    });

                    // Keep the risk engine's position and P&L state
                    // current before the next pre-trade check.
                    if let Some(order) = self.oms.query(&fill.client_id) {
                        self.risk
                            .on_fill(order.symbol, order.side, fill.qty.as_i64());
                    }
                    let realized = self.oms.positions().total_realized();
                    let realized_delta = realized - self.last_realized;
                    self.last_realized = realized;
                    self.risk.on_pnl(
                        realized_delta,
                        self.oms.positions().total_unrealized(),
                        fill.ts,
                    );

                    self.emit_account(fill.ts);
                    updates.push(ExecutionUpdate::Position(position));
                }
                OmsEvent::OrderError { client_id, error } => {
                    let (ts_ns, ts_iso) = stamp(clock::now());
                    self.emitter.emit(OutEvent::Error {
                        ts_ns,
                        ts_iso,
                        code: error.code().to_string(),
                        message: error.to_string(),
                        client_order_id: client_id.as_ref().map(ToString::to_string),
                    });
                    let strategy_id = client_id
                        .as_ref()
                        .and_then(|id| self.oms.query(id))
                        .and_then(|o| o.strategy_id);
                    updates.push(ExecutionUpdate::OrderFailed {
                        client_id,
                        code: error.code().to_string(),
                        strategy_id,
                    });
                }
            }
        }
        updates
    }

    fn emit_account(&self, ts: Ts) {
        let positions = self
            .oms
            .positions()
            .open_positions()
            .into_iter()
            .map(|p| PositionJson {
                symbol: self
                    .registry
                    .name(p.symbol)
                    .unwrap_or_else(|| p.symbol.to_string()),
                qty: Qty::from_i64(p.qty).to_decimal_string(),
                avg_entry: p.avg_entry.to_decimal_string(),
                realized_pnl: Px::from_i64(p.realized_pnl).to_decimal_string(),
                unrealized_pnl: Px::from_i64(p.unrealized_pnl).to_decimal_string(),
            })
            .collect();
        let (ts_ns, ts_iso) = stamp(ts);
        self.emitter.emit(OutEvent::Account {
            ts_ns,
            ts_iso,
            positions,
            realized_pnl: Px::from_i64(self.oms.positions().total_realized()).to_decimal_string(),
            unrealized_pnl: Px::from_i64(self.oms.positions().total_unrealized())
                .to_decimal_string(),
        });
    }
}

/// Cloneable submission context shared by the signal and stdio paths
#[derive(Clone)]
struct SubmitCtx {
    orders: Arc<Mutex<OrderHub>>,
    market: Arc<Mutex<MarketHub>>,
    market_loop: EventLoopHandle,
    order_loop: EventLoopHandle,
    router: Arc<OrderRouter>,
    emitter: EventEmitter,
    tokio: tokio::runtime::Handle,
}

/// The assembled engine
pub struct App {
    market: Arc<Mutex<MarketHub>>,
    orders: Arc<Mutex<OrderHub>>,
    market_loop: EventLoopHandle,
    order_loop: EventLoopHandle,
    router: Arc<OrderRouter>,
    bridge: Arc<SignalBridge>,
    risk: Arc<RiskEngine>,
    ids: Arc<IdAllocator>,
    emitter: EventEmitter,
    registry: Arc<SymbolRegistry>,
    venues: FxHashMap<Symbol, Venue>,
    sim: Option<Arc<SimAdapter>>,
    metrics: Arc<MetricsRegistry>,
    tokio: tokio::runtime::Runtime,
    joins: Vec<std::thread::JoinHandle<()>>,
    ws_shutdown: Option<tokio::sync::watch::Sender<bool>>,
}

impl App {
    /// Build and start every subsystem
    pub fn start(
        mut config: EngineConfig,
        env: &EnvOverrides,
        emitter: EventEmitter,
    ) -> anyhow::Result<Self> {
        clock::init(config.clock.max_offset_ns);
        common::metrics::init();
        // One registry for the whole process: the router, bridge and feed
        // counters all land in the same render.
        let metrics = common::metrics::global();

        if let Some(mode) = &env.wal_sync_mode {
            config.wal.sync_mode = match mode.as_str() {
                "async" => WalSyncMode::Async,
                _ => WalSyncMode::Fsync,
            };
        }

        // Instrument registry from market configuration.
        let registry = Arc::new(SymbolRegistry::new());
        let mut venues = FxHashMap::default();
        for (name, market) in &config.market {
            let venue: Venue = market
                .venue
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let symbol = registry.register(
                name,
                venue,
                common::ScaleInfo {
                    price_decimals: market.price_decimals,
                    qty_decimals: market.qty_decimals,
                },
                0,
            );
            venues.insert(symbol, venue);
        }

        // Journal and OMS recovery.
        let (wal, recovery) = if config.wal.enabled {
            let (wal, recovery) = Wal::open(&config.wal)?;
            (Some(wal), Some(recovery))
        } else {
            (None, None)
        };
        let mut oms = OrderManager::new(wal);
        if let Some(recovery) = &recovery {
            oms.recover(recovery)?;
        }

        let risk = Arc::new(RiskEngine::new(config.risk.clone()));
        let breakers = Arc::new(BreakerRegistry::new(
            &config.circuit,
            [Venue::Binance, Venue::Okx, Venue::Bybit, Venue::Coinbase],
        ));

        // Execution mode: the simulated venue backs paper trading; live
        // adapter bodies plug in through the same contract.
        let exec_mode = env.exec_mode.as_deref().unwrap_or("paper").to_string();
        if exec_mode == "live" {
            warn!("live execution requested; no live adapter configured, using sim venue");
        }
        let sim = Arc::new(SimAdapter::new(Venue::Binance));
        let adapters: Vec<Arc<dyn ExchangeAdapter>> = vec![Arc::clone(&sim) as _];
        let router = Arc::new(OrderRouter::new(
            adapters,
            config.router.clone(),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
        ));

        let ids = Arc::new(IdAllocator::new(
            "q",
            config
                .wal
                .enabled
                .then(|| std::path::Path::new(&config.wal.dir)),
        )?);
        let bridge = Arc::new(SignalBridge::new(
            Arc::clone(&risk),
            Arc::clone(&ids),
            venues.clone(),
            Arc::clone(&metrics),
        ));

        // Strategies.
        let mut strategies = StrategyRuntime::new();
        let mut strategy_symbols = Vec::new();
        for sc in &config.strategy {
            // A strategy binds to the symbol named in its parameters, or
            // the first configured market.
            let symbol_name = sc
                .parameters
                .get("symbol")
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .or_else(|| config.market.keys().next().cloned());
            let Some(symbol_name) = symbol_name else {
                warn!(strategy = %sc.id, "no market configured; skipping strategy");
                continue;
            };
            let Some(symbol) = registry.lookup(&symbol_name) else {
                warn!(strategy = %sc.id, symbol = %symbol_name, "unknown symbol; skipping");
                continue;
            };
            let mut params = sc.clone();
            params.parameters.remove("symbol");
            strategies.register(builtin::build(&params, symbol)?);
            strategy_symbols.push((sc.id.clone(), symbol));
        }

        // Market hub.
        let mut klines = KlineService::new();
        for (name, market) in &config.market {
            if let Some(symbol) = registry.lookup(name) {
                for period in &market.kline_periods_ms {
                    klines.add(symbol, *period);
                }
            }
        }
        let tops: Arc<DashMap<Symbol, BookTop>> = Arc::new(DashMap::new());
        let mut market_hub = MarketHub {
            registry: Arc::clone(&registry),
            books: FxHashMap::default(),
            subs: SubscriptionManager::new(),
            strategy_subs: FxHashMap::default(),
            delivery: Arc::new(Mutex::new(Vec::new())),
            klines,
            quality: QualityDetector::new(QualityConfig::default()),
            strategies,
            tops: Arc::clone(&tops),
            emitter: emitter.clone(),
            risk: Arc::clone(&risk),
            mark_hook: None,
        };
        for (strategy_id, symbol) in &strategy_symbols {
            let venue = venues.get(symbol).copied().unwrap_or(Venue::Binance);
            market_hub.subscribe_strategy(strategy_id, *symbol, venue);
        }
        for failure in market_hub.strategies.start_all() {
            market_hub.isolate_strategy(&failure);
        }

        let orders = Arc::new(Mutex::new(OrderHub {
            oms,
            risk: Arc::clone(&risk),
            emitter: emitter.clone(),
            registry: Arc::clone(&registry),
            last_realized: 0,
        }));
        let market = Arc::new(Mutex::new(market_hub));

        // Dispatchers and I/O workers.
        let (market_ev, market_loop) =
            EventLoop::new("market-dispatcher", EventLoopConfig::default());
        let (order_ev, order_loop) = EventLoop::new("order-dispatcher", EventLoopConfig::default());
        let joins = vec![market_ev.spawn(), order_ev.spawn()];

        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("io-worker")
            .build()?;

        let mut app = Self {
            market,
            orders,
            market_loop,
            order_loop,
            router,
            bridge,
            risk,
            ids,
            emitter,
            registry,
            venues,
            sim: Some(sim),
            metrics,
            tokio,
            joins,
            ws_shutdown: None,
        };

        // Mid marks flow to the order dispatcher for unrealized P&L.
        {
            let orders = Arc::clone(&app.orders);
            let order_loop = app.order_loop.clone();
            app.market.lock().mark_hook = Some(Box::new(move |symbol, mid| {
                let orders = Arc::clone(&orders);
                order_loop.post(Priority::Low, move || {
                    let now = clock::now();
                    let mut hub = orders.lock();
                    hub.oms.on_mark(symbol, mid, now);
                    let unrealized = hub.oms.positions().total_unrealized();
                    hub.risk.on_pnl(0, unrealized, now);
                });
            }));
        }

        app.wire_user_stream();
        app.wire_timers(config.wal.flush_interval_ms.max(1));
        app.ws_shutdown = app.wire_market_feed(&config, env);

        let (ts_ns, ts_iso) = stamp(clock::now());
        app.emitter.emit(OutEvent::EngineStarted {
            ts_ns,
            ts_iso,
            symbols: config.market.keys().cloned().collect(),
            mode: exec_mode,
        });
        info!("engine started");
        Ok(app)
    }

    /// The simulated venue, for paper mode tooling and tests
    #[must_use]
    pub fn sim_adapter(&self) -> Option<Arc<SimAdapter>> {
        self.sim.clone()
    }

    /// Feed one market event as if it came from a live feed
    pub fn inject_market_event(&self, event: MarketEvent) {
        let ctx = self.submit_ctx();
        let bridge = Arc::clone(&self.bridge);
        let market = Arc::clone(&self.market);
        self.market_loop.post(Priority::High, move || {
            let signals = market.lock().handle_feed_event(&event);
            pump_signals(&ctx, &bridge, signals);
        });
    }

    /// Handle one stdin line
    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_line(line) {
            Ok(command) => self.dispatch_command(command),
            Err(e) => {
                let (ts_ns, ts_iso) = stamp(clock::now());
                self.emitter.emit(OutEvent::Error {
                    ts_ns,
                    ts_iso,
                    code: "parse".to_string(),
                    message: e.to_string(),
                    client_order_id: None,
                });
            }
        }
    }

    /// Run the blocking stdin loop until EOF
    pub fn run_stdin_loop(&self) {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => self.handle_line(&line),
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    }

    /// Graceful shutdown: stop strategies, flush the journal, emit the
    /// final event and join the dispatchers
    pub fn shutdown(mut self) {
        info!("engine stopping");
        if let Some(tx) = self.ws_shutdown.take() {
            let _ = tx.send(true);
        }
        self.market.lock().strategies.stop_all();
        {
            let mut orders = self.orders.lock();
            if let Err(e) = orders.oms.flush_wal() {
                error!(error = %e, "final wal flush failed");
            }
        }
        if let Err(e) = self.ids.persist() {
            warn!(error = %e, "id counter persist failed");
        }
        info!(metrics = %self.metrics.render(), "final metrics");

        let (ts_ns, ts_iso) = stamp(clock::now());
        self.emitter.emit(OutEvent::EngineStopped { ts_ns, ts_iso });

        self.market_loop.shutdown();
        self.order_loop.shutdown();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        self.tokio
            .shutdown_timeout(std::time::Duration::from_secs(2));
    }

    fn dispatch_command(&self, command: Command) {
        match command {
            Command::Order {
                side,
                symbol,
                qty,
                price,
                client_id,
            } => {
                let Some(symbol_id) = self.registry.lookup(&symbol) else {
                    let (ts_ns, ts_iso) = stamp(clock::now());
                    self.emitter.emit(OutEvent::Error {
                        ts_ns,
                        ts_iso,
                        code: "parse".to_string(),
                        message: format!("unknown symbol: {symbol}"),
                        client_order_id: Some(client_id.to_string()),
                    });
                    return;
                };
                let venue = self
                    .venues
                    .get(&symbol_id)
                    .copied()
                    .unwrap_or(Venue::Binance);
                let req = PlaceOrderRequest {
                    client_id,
                    venue,
                    symbol: symbol_id,
                    side,
                    order_type: OrderType::Limit,
                    price: Some(price),
                    qty,
                    tif: TimeInForce::Gtc,
                    strategy_id: None,
                };
                self.submit_stdio_order(req);
            }
            Command::Cancel { client_id } => self.request_cancel(client_id),
            Command::Query { client_id } => self.query_order(client_id),
        }
    }

    /// Risk-gate, announce and submit a stdio order
    fn submit_stdio_order(&self, req: PlaceOrderRequest) {
        let ctx = self.submit_ctx();
        let risk = Arc::clone(&self.risk);
        self.order_loop.post(Priority::High, move || {
            let now = clock::now();

            // Pre-trade gate: a rejected order never reaches the router.
            if let Err(error) = risk.check(&req.intent(), now) {
                let (ts_ns, ts_iso) = stamp(now);
                ctx.emitter.emit(OutEvent::Error {
                    ts_ns,
                    ts_iso,
                    code: error.code().to_string(),
                    message: error.to_string(),
                    client_order_id: Some(req.client_id.to_string()),
                });
                return;
            }

            let (ts_ns, ts_iso) = stamp(now);
            ctx.emitter.emit(OutEvent::OrderReceived {
                ts_ns,
                ts_iso,
                client_order_id: req.client_id.to_string(),
            });
            submit_inline(&ctx, req);
        });
    }

    fn request_cancel(&self, client_id: ClientOrderId) {
        let ctx = self.submit_ctx();
        let venues = self.venues.clone();
        self.order_loop.post(Priority::High, move || {
            let now = clock::now();
            let mut hub = ctx.orders.lock();
            let Some(order) = hub.oms.query(&client_id) else {
                let (ts_ns, ts_iso) = stamp(now);
                ctx.emitter.emit(OutEvent::Error {
                    ts_ns,
                    ts_iso,
                    code: "unknown_order".to_string(),
                    message: format!("unknown order: {client_id}"),
                    client_order_id: Some(client_id.to_string()),
                });
                return;
            };

            match hub.oms.request_cancel(&client_id, now) {
                Ok(events) => {
                    let updates = hub.publish(events);
                    drop(hub);
                    forward_updates(&ctx.market_loop, &ctx.market, updates);

                    let venue = venues.get(&order.symbol).copied().unwrap_or(order.venue);
                    let symbol = order.symbol;
                    let router = Arc::clone(&ctx.router);
                    let emitter = ctx.emitter.clone();
                    ctx.tokio.spawn(async move {
                        if let Err(error) = router.cancel_order(venue, symbol, &client_id).await {
                            let (ts_ns, ts_iso) = stamp(clock::now());
                            emitter.emit(OutEvent::Error {
                                ts_ns,
                                ts_iso,
                                code: error.code().to_string(),
                                message: error.to_string(),
                                client_order_id: Some(client_id.to_string()),
                            });
                        }
                    });
                }
                Err(error) => {
                    let (ts_ns, ts_iso) = stamp(now);
                    ctx.emitter.emit(OutEvent::Error {
                        ts_ns,
                        ts_iso,
                        code: error.code().to_string(),
                        message: error.to_string(),
                        client_order_id: Some(client_id.to_string()),
                    });
                }
            }
        });
    }

    fn query_order(&self, client_id: ClientOrderId) {
        let orders = Arc::clone(&self.orders);
        let emitter = self.emitter.clone();
        self.order_loop.post(Priority::Normal, move || {
            let hub = orders.lock();
            let (ts_ns, ts_iso) = stamp(clock::now());
            match hub.oms.query(&client_id) {
                Some(order) => emitter.emit(OutEvent::OrderState {
                    ts_ns,
                    ts_iso,
                    client_order_id: order.client_id.to_string(),
                    state: order.state.as_str().to_string(),
                    venue_order_id: order.venue_order_id.as_ref().map(ToString::to_string),
                    exec_qty: order.exec_qty.to_decimal_string(),
                    avg_price: order.avg_price.to_decimal_string(),
                }),
                None => emitter.emit(OutEvent::Error {
                    ts_ns,
                    ts_iso,
                    code: "unknown_order".to_string(),
                    message: format!("unknown order: {client_id}"),
                    client_order_id: Some(client_id.to_string()),
                }),
            }
        });
    }

    fn submit_ctx(&self) -> SubmitCtx {
        SubmitCtx {
            orders: Arc::clone(&self.orders),
            market: Arc::clone(&self.market),
            market_loop: self.market_loop.clone(),
            order_loop: self.order_loop.clone(),
            router: Arc::clone(&self.router),
            emitter: self.emitter.clone(),
            tokio: self.tokio.handle().clone(),
        }
    }

    /// Adapter user stream into the order dispatcher
    fn wire_user_stream(&self) {
        let Some(sim) = &self.sim else {
            return;
        };
        let (tx, mut rx) = tokio::sync::mpsc::channel(1_024);
        let sim = Arc::clone(sim);
        let orders = Arc::clone(&self.orders);
        let market = Arc::clone(&self.market);
        let market_loop = self.market_loop.clone();
        let order_loop = self.order_loop.clone();

        self.tokio.spawn(async move {
            if sim.subscribe_user_stream(tx).await.is_err() {
                error!("user stream subscription failed");
                return;
            }
            while let Some(event) = rx.recv().await {
                let orders = Arc::clone(&orders);
                let market = Arc::clone(&market);
                let market_loop = market_loop.clone();
                order_loop.post(Priority::Critical, move || {
                    let now = clock::now();
                    let mut hub = orders.lock();
                    let events = hub.oms.on_exchange_event(event, now);
                    let updates = hub.publish(events);
                    drop(hub);
                    forward_updates(&market_loop, &market, updates);
                });
            }
        });
    }

    /// Periodic sweeps on both dispatchers
    fn wire_timers(&self, flush_interval_ms: u64) {
        // Order dispatcher: journal flush, parked-event sweep, pruning.
        let orders = Arc::clone(&self.orders);
        let market = Arc::clone(&self.market);
        let market_loop = self.market_loop.clone();
        schedule_every(
            &self.order_loop,
            std::time::Duration::from_millis(flush_interval_ms),
            move || {
                let mut hub = orders.lock();
                if let Err(e) = hub.oms.flush_wal() {
                    let (ts_ns, ts_iso) = stamp(clock::now());
                    hub.emitter.emit(OutEvent::Error {
                        ts_ns,
                        ts_iso,
                        code: "wal_write".to_string(),
                        message: e.to_string(),
                        client_order_id: None,
                    });
                }
                let now = clock::now();
                let events = hub.oms.sweep_parked(now);
                let updates = hub.publish(events);
                hub.oms.prune_terminal(now, 60_000_000_000);
                drop(hub);
                forward_updates(&market_loop, &market, updates);
            },
        );

        // Market dispatcher: kline close timers, strategy ticks.
        let market = Arc::clone(&self.market);
        let bridge = Arc::clone(&self.bridge);
        let ctx = self.submit_ctx();
        schedule_every(
            &self.market_loop,
            std::time::Duration::from_millis(250),
            move || {
                let signals = market.lock().handle_timer(clock::now());
                pump_signals(&ctx, &bridge, signals);
            },
        );
    }

    /// Live market feed, when configured
    fn wire_market_feed(
        &self,
        config: &EngineConfig,
        env: &EnvOverrides,
    ) -> Option<tokio::sync::watch::Sender<bool>> {
        let source = env.market_source.as_deref().unwrap_or("sim");
        if source != "binance" {
            info!(source, "no live market feed; sim source");
            return None;
        }

        let mut symbols = Vec::new();
        for name in config.market.keys() {
            if let Some(symbol) = self.registry.lookup(name) {
                symbols.push((name.clone(), symbol));
            }
        }
        let mut endpoints = BinanceEndpoints::default();
        if let Some(ws) = &env.ws_base_url {
            endpoints.ws_base = ws.clone();
        }
        if let Some(rest) = &env.rest_base_url {
            endpoints.rest_base = rest.clone();
        }
        let decoder = BinanceDecoder::new(endpoints, symbols, true);

        let (feed_tx, mut feed_rx) = tokio::sync::mpsc::channel(8_192);
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let client = WsClient::new(decoder, WsClientConfig::default(), feed_tx, stop_rx);
        self.tokio.spawn(client.run());

        // Pump decoded events into the market dispatcher.
        let market = Arc::clone(&self.market);
        let bridge = Arc::clone(&self.bridge);
        let ctx = self.submit_ctx();
        let market_loop = self.market_loop.clone();
        let metrics = Arc::clone(&self.metrics);
        self.tokio.spawn(async move {
            while let Some(message) = feed_rx.recv().await {
                match message {
                    FeedMessage::Event(event) => {
                        let market = Arc::clone(&market);
                        let bridge = Arc::clone(&bridge);
                        let ctx = ctx.clone();
                        market_loop.post(Priority::High, move || {
                            let signals = market.lock().handle_feed_event(&event);
                            pump_signals(&ctx, &bridge, signals);
                        });
                    }
                    FeedMessage::State(state) => info!(?state, "market feed state"),
                    FeedMessage::ParseErrors(count) => {
                        metrics.counter("feed_parse_errors_total").add(count);
                    }
                }
            }
        });
        Some(stop_tx)
    }
}

/// Push strategy signals through the bridge and into the order path
fn pump_signals(ctx: &SubmitCtx, bridge: &SignalBridge, signals: Vec<(String, Signal)>) {
    for (strategy_id, signal) in signals {
        let now = clock::now();
        match bridge.process(&strategy_id, &signal, now) {
            BridgeOutcome::Accepted(req) => {
                let ctx_clone = ctx.clone();
                ctx.order_loop.post(Priority::High, move || {
                    submit_inline(&ctx_clone, req);
                });
            }
            BridgeOutcome::Rejected { strategy_id, error } => {
                let (ts_ns, ts_iso) = stamp(now);
                ctx.emitter.emit(OutEvent::Error {
                    ts_ns,
                    ts_iso,
                    code: error.code().to_string(),
                    message: error.to_string(),
                    client_order_id: None,
                });
                let update = ExecutionUpdate::OrderFailed {
                    client_id: None,
                    code: error.code().to_string(),
                    strategy_id: Some(strategy_id),
                };
                let market = Arc::clone(&ctx.market);
                ctx.market_loop.post(Priority::Normal, move || {
                    market.lock().strategies.on_execution_update(&update);
                });
            }
        }
    }
}

/// Submission body; must run on the order dispatcher
fn submit_inline(ctx: &SubmitCtx, req: PlaceOrderRequest) {
    let now = clock::now();
    let mut hub = ctx.orders.lock();
    let events = match hub.oms.register_new(&req, now) {
        Ok(events) => events,
        Err(error) => {
            let (ts_ns, ts_iso) = stamp(now);
            ctx.emitter.emit(OutEvent::Error {
                ts_ns,
                ts_iso,
                code: error.code().to_string(),
                message: error.to_string(),
                client_order_id: Some(req.client_id.to_string()),
            });
            return;
        }
    };
    let mut updates = hub.publish(events);
    let submit_events = hub.oms.mark_submitted(&req.client_id, clock::now());
    updates.extend(hub.publish(submit_events));
    drop(hub);
    forward_updates(&ctx.market_loop, &ctx.market, updates);

    // Hand the adapter call to an I/O worker; its completion posts back
    // onto the order dispatcher.
    let client_id = req.client_id.clone();
    let inner = ctx.clone();
    ctx.tokio.spawn(async move {
        let result = inner.router.place_order(&req).await;
        let orders = Arc::clone(&inner.orders);
        let market = Arc::clone(&inner.market);
        let market_loop = inner.market_loop.clone();
        inner.order_loop.post(Priority::Critical, move || {
            let now = clock::now();
            let mut hub = orders.lock();
            let events = match result {
                Ok(ack) => hub.oms.on_exchange_event(
                    ExchangeEvent::Ack {
                        client_id: client_id.clone(),
                        venue_order_id: ack.venue_order_id,
                        event_seq: 1,
                        ts: now,
                    },
                    now,
                ),
                Err(error) => hub.oms.mark_rejected(&client_id, error, now),
            };
            let updates = hub.publish(events);
            drop(hub);
            forward_updates(&market_loop, &market, updates);
        });
    });
}

/// Forward execution feedback to strategies on the market dispatcher
fn forward_updates(
    market_loop: &EventLoopHandle,
    market: &Arc<Mutex<MarketHub>>,
    updates: Vec<ExecutionUpdate>,
) {
    if updates.is_empty() {
        return;
    }
    let market = Arc::clone(market);
    market_loop.post(Priority::Normal, move || {
        let mut hub = market.lock();
        for update in &updates {
            hub.strategies.on_execution_update(update);
        }
    });
}

/// Re-arm a callback on a fixed interval
fn schedule_every(
    handle: &EventLoopHandle,
    interval: std::time::Duration,
    f: impl Fn() + Send + Sync + 'static,
) {
    fn arm(
        handle: EventLoopHandle,
        interval: std::time::Duration,
        f: Arc<dyn Fn() + Send + Sync>,
    ) {
        let rearm_handle = handle.clone();
        handle.schedule(interval, move || {
            f();
            arm(rearm_handle, interval, f);
        });
    }
    arm(handle.clone(), interval, Arc::new(f));
}
