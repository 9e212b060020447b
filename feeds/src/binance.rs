//! Binance market stream decoding
//!
//! Combined-stream JSON frames normalize into [`MarketEvent`]s. Depth
//! sequencing follows the venue's documented algorithm: updates are
//! contiguous when `first_update_id == last_update_id + 1`; a hole marks
//! the symbol out of sync, deltas are suppressed and a REST snapshot is
//! requested. The decoder re-numbers accepted updates onto the engine's
//! per-feed sequence so the order book sees a gap exactly when the venue
//! feed had one.

use crate::decoder::{DecodeOutput, FeedDecoder};
use common::{
    BookDelta, BookSnapshot, EngineError, MarketEvent, MarketPayload, Px, Qty, Side, Symbol,
    TickerData, TradeEvent, Ts, Venue,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// Binance depth update message
#[derive(Debug, Deserialize)]
pub struct DepthUpdate {
    /// Event time, milliseconds
    #[serde(rename = "E")]
    pub event_time: u64,
    /// Wire symbol
    #[serde(rename = "s")]
    pub symbol: String,
    /// First update id in this message
    #[serde(rename = "U")]
    pub first_update_id: u64,
    /// Final update id in this message
    #[serde(rename = "u")]
    pub final_update_id: u64,
    /// Bid levels as decimal strings
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    /// Ask levels as decimal strings
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Binance trade message
#[derive(Debug, Deserialize)]
pub struct TradeUpdate {
    /// Event time, milliseconds
    #[serde(rename = "E")]
    pub event_time: u64,
    /// Wire symbol
    #[serde(rename = "s")]
    pub symbol: String,
    /// Price as a decimal string
    #[serde(rename = "p")]
    pub price: String,
    /// Quantity as a decimal string
    #[serde(rename = "q")]
    pub quantity: String,
    /// True when the buyer is the maker (aggressor sold)
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Binance book ticker message
#[derive(Debug, Deserialize)]
pub struct BookTickerUpdate {
    /// Wire symbol
    #[serde(rename = "s")]
    pub symbol: String,
    /// Best bid price
    #[serde(rename = "b")]
    pub bid_price: String,
    /// Best bid quantity
    #[serde(rename = "B")]
    pub bid_qty: String,
    /// Best ask price
    #[serde(rename = "a")]
    pub ask_price: String,
    /// Best ask quantity
    #[serde(rename = "A")]
    pub ask_qty: String,
}

/// Binance REST depth snapshot
#[derive(Debug, Deserialize)]
pub struct DepthSnapshot {
    /// Update id the snapshot reflects
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    /// Bid levels as decimal strings
    pub bids: Vec<[String; 2]>,
    /// Ask levels as decimal strings
    pub asks: Vec<[String; 2]>,
}

/// Combined stream envelope
#[derive(Debug, Deserialize)]
struct StreamMessage {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Default)]
struct SymbolSync {
    /// Last accepted venue update id; 0 before first snapshot
    venue_last_u: u64,
    /// Engine-normalized feed sequence for depth
    depth_seq: u64,
    /// Engine-normalized feed sequence for trades
    trade_seq: u64,
    /// Engine-normalized feed sequence for tickers
    ticker_seq: u64,
    /// In-sync flag; deltas are suppressed while false
    synced: bool,
    /// Snapshot request already pending
    snapshot_pending: bool,
}

/// Stateful decoder for Binance combined streams
pub struct BinanceDecoder {
    endpoints: BinanceEndpoints,
    symbols: FxHashMap<String, Symbol>,
    names: FxHashMap<Symbol, String>,
    sync: FxHashMap<Symbol, SymbolSync>,
    want_ticker: bool,
}

/// Binance endpoint set
#[derive(Debug, Clone)]
pub struct BinanceEndpoints {
    /// WebSocket base, e.g. `wss://stream.binance.com:9443`
    pub ws_base: String,
    /// REST base, e.g. `https://api.binance.com`
    pub rest_base: String,
}

impl Default for BinanceEndpoints {
    fn default() -> Self {
        Self {
            ws_base: "wss://stream.binance.com:9443".to_string(),
            rest_base: "https://api.binance.com".to_string(),
        }
    }
}

impl BinanceDecoder {
    /// Create a decoder for a set of (wire name, symbol) pairs
    #[must_use]
    pub fn new(
        endpoints: BinanceEndpoints,
        symbols: impl IntoIterator<Item = (String, Symbol)>,
        want_ticker: bool,
    ) -> Self {
        let mut by_name = FxHashMap::default();
        let mut names = FxHashMap::default();
        let mut sync = FxHashMap::default();
        for (name, symbol) in symbols {
            by_name.insert(name.to_uppercase(), symbol);
            names.insert(symbol, name.to_lowercase());
            sync.insert(symbol, SymbolSync::default());
        }
        Self {
            endpoints,
            symbols: by_name,
            names,
            sync,
            want_ticker,
        }
    }

    fn parse_levels(levels: &[[String; 2]], side: Side) -> Result<Vec<BookDelta>, EngineError> {
        levels
            .iter()
            .map(|[price, qty]| {
                Ok(BookDelta {
                    side,
                    price: Px::parse(price).map_err(|e| EngineError::Parse(e.to_string()))?,
                    qty: Qty::parse(qty).map_err(|e| EngineError::Parse(e.to_string()))?,
                })
            })
            .collect()
    }

    fn decode_depth(&mut self, data: &serde_json::Value, ts_recv: Ts, out: &mut DecodeOutput) {
        let Ok(update) = serde_json::from_value::<DepthUpdate>(data.clone()) else {
            out.parse_errors += 1;
            return;
        };
        let Some(symbol) = self.symbols.get(&update.symbol.to_uppercase()).copied() else {
            return;
        };
        let Some(state) = self.sync.get_mut(&symbol) else {
            return;
        };

        if !state.synced {
            if !state.snapshot_pending {
                state.snapshot_pending = true;
                out.need_snapshot.push(symbol);
            }
            return;
        }

        // Stale relative to the applied snapshot.
        if update.final_update_id <= state.venue_last_u {
            return;
        }

        if update.first_update_id > state.venue_last_u + 1 {
            warn!(
                symbol = %symbol,
                expected = state.venue_last_u + 1,
                got = update.first_update_id,
                "binance depth gap; resyncing"
            );
            state.synced = false;
            state.snapshot_pending = true;
            // Surface the gap to the book: skip one engine sequence.
            state.depth_seq += 1;
            out.need_snapshot.push(symbol);
            return;
        }

        let mut deltas = match Self::parse_levels(&update.bids, Side::Buy) {
            Ok(d) => d,
            Err(_) => {
                out.parse_errors += 1;
                return;
            }
        };
        match Self::parse_levels(&update.asks, Side::Sell) {
            Ok(mut asks) => deltas.append(&mut asks),
            Err(_) => {
                out.parse_errors += 1;
                return;
            }
        }

        state.venue_last_u = update.final_update_id;
        state.depth_seq += 1;
        out.events.push(MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq: state.depth_seq,
            ts_exchange: Ts::from_millis(update.event_time),
            ts_recv,
            payload: MarketPayload::BookDelta(deltas),
        });
    }

    fn decode_trade(&mut self, data: &serde_json::Value, ts_recv: Ts, out: &mut DecodeOutput) {
        let Ok(trade) = serde_json::from_value::<TradeUpdate>(data.clone()) else {
            out.parse_errors += 1;
            return;
        };
        let Some(symbol) = self.symbols.get(&trade.symbol.to_uppercase()).copied() else {
            return;
        };
        let (Ok(price), Ok(qty)) = (Px::parse(&trade.price), Qty::parse(&trade.quantity)) else {
            out.parse_errors += 1;
            return;
        };
        let state = self.sync.entry(symbol).or_default();
        state.trade_seq += 1;
        out.events.push(MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq: state.trade_seq,
            ts_exchange: Ts::from_millis(trade.event_time),
            ts_recv,
            payload: MarketPayload::Trade(TradeEvent {
                price,
                qty,
                // Buyer-as-maker means the aggressor sold.
                side: if trade.is_buyer_maker {
                    Side::Sell
                } else {
                    Side::Buy
                },
            }),
        });
    }

    fn decode_ticker(&mut self, data: &serde_json::Value, ts_recv: Ts, out: &mut DecodeOutput) {
        let Ok(ticker) = serde_json::from_value::<BookTickerUpdate>(data.clone()) else {
            out.parse_errors += 1;
            return;
        };
        let Some(symbol) = self.symbols.get(&ticker.symbol.to_uppercase()).copied() else {
            return;
        };
        let parsed = (
            Px::parse(&ticker.bid_price),
            Qty::parse(&ticker.bid_qty),
            Px::parse(&ticker.ask_price),
            Qty::parse(&ticker.ask_qty),
        );
        let (Ok(bp), Ok(bq), Ok(ap), Ok(aq)) = parsed else {
            out.parse_errors += 1;
            return;
        };
        let state = self.sync.entry(symbol).or_default();
        state.ticker_seq += 1;
        out.events.push(MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq: state.ticker_seq,
            ts_exchange: ts_recv,
            ts_recv,
            payload: MarketPayload::Ticker(TickerData {
                bid: Some((bp, bq)),
                ask: Some((ap, aq)),
                last: None,
            }),
        });
    }
}

impl FeedDecoder for BinanceDecoder {
    fn decode(&mut self, text: &str, ts_recv: Ts) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        let Ok(msg) = serde_json::from_str::<StreamMessage>(text) else {
            out.parse_errors += 1;
            return out;
        };

        if msg.stream.contains("@depth") {
            self.decode_depth(&msg.data, ts_recv, &mut out);
        } else if msg.stream.contains("@trade") {
            self.decode_trade(&msg.data, ts_recv, &mut out);
        } else if msg.stream.contains("@bookTicker") {
            self.decode_ticker(&msg.data, ts_recv, &mut out);
        }
        out
    }

    fn stream_url(&self) -> String {
        let mut streams = Vec::new();
        for name in self.names.values() {
            streams.push(format!("{name}@depth@100ms"));
            streams.push(format!("{name}@trade"));
            if self.want_ticker {
                streams.push(format!("{name}@bookTicker"));
            }
        }
        format!(
            "{}/stream?streams={}",
            self.endpoints.ws_base,
            streams.join("/")
        )
    }

    fn snapshot_url(&self, symbol: Symbol) -> Option<String> {
        let name = self.names.get(&symbol)?;
        Some(format!(
            "{}/api/v3/depth?symbol={}&limit=1000",
            self.endpoints.rest_base,
            name.to_uppercase()
        ))
    }

    fn apply_snapshot(
        &mut self,
        symbol: Symbol,
        raw: &str,
        ts_recv: Ts,
    ) -> Result<MarketEvent, EngineError> {
        let snapshot: DepthSnapshot =
            serde_json::from_str(raw).map_err(|e| EngineError::Parse(e.to_string()))?;
        let bids = snapshot
            .bids
            .iter()
            .map(|[p, q]| {
                Ok((
                    Px::parse(p).map_err(|e| EngineError::Parse(e.to_string()))?,
                    Qty::parse(q).map_err(|e| EngineError::Parse(e.to_string()))?,
                ))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        let asks = snapshot
            .asks
            .iter()
            .map(|[p, q]| {
                Ok((
                    Px::parse(p).map_err(|e| EngineError::Parse(e.to_string()))?,
                    Qty::parse(q).map_err(|e| EngineError::Parse(e.to_string()))?,
                ))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let state = self.sync.entry(symbol).or_default();
        state.venue_last_u = snapshot.last_update_id;
        state.synced = true;
        state.snapshot_pending = false;
        // The snapshot supersedes everything the book has buffered, so it
        // takes the current engine sequence as its own.
        let snapshot_seq = state.depth_seq;
        debug!(
            symbol = %symbol,
            venue_u = snapshot.last_update_id,
            snapshot_seq,
            "binance snapshot applied"
        );

        Ok(MarketEvent {
            symbol,
            venue: Venue::Binance,
            seq: snapshot_seq,
            ts_exchange: ts_recv,
            ts_recv,
            payload: MarketPayload::BookSnapshot(BookSnapshot {
                snapshot_seq,
                bids,
                asks,
            }),
        })
    }

    fn on_disconnect(&mut self) {
        for state in self.sync.values_mut() {
            state.synced = false;
            state.snapshot_pending = false;
        }
    }

    fn initial_snapshots(&mut self) -> Vec<Symbol> {
        let mut need = Vec::new();
        for (symbol, state) in &mut self.sync {
            if !state.synced && !state.snapshot_pending {
                state.snapshot_pending = true;
                need.push(*symbol);
            }
        }
        need
    }
}
