//! Outbound NDJSON event stream
//!
//! One JSON object per line on stdout, UTF-8, LF endings. Every event
//! carries a stable `type` tag plus `ts_ns`/`ts_iso` timestamps. A
//! bounded outbound queue applies backpressure to order-path events and
//! drops market-noise events first when full, counting the drops.

use common::Ts;
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Default bound for each outbound queue
const QUEUE_BOUND: usize = 8_192;

/// Everything the engine can emit on stdout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutEvent {
    /// Engine finished bootstrapping
    EngineStarted {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Configured symbols
        symbols: Vec<String>,
        /// Execution mode tag
        mode: String,
    },
    /// Engine is shutting down
    EngineStopped {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
    },
    /// A market data point (trade, closed kline or anomaly)
    Market {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Wire symbol
        symbol: String,
        /// Payload kind: `trade`, `kline`, `anomaly`
        kind: String,
        /// Kind-specific fields
        data: serde_json::Value,
    },
    /// Top of book changed
    BookTop {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Wire symbol
        symbol: String,
        /// Best bid price, decimal string
        bid: Option<String>,
        /// Best bid size, decimal string
        bid_qty: Option<String>,
        /// Best ask price, decimal string
        ask: Option<String>,
        /// Best ask size, decimal string
        ask_qty: Option<String>,
    },
    /// A command was accepted from stdin
    OrderReceived {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Client order id
        client_order_id: String,
    },
    /// Order state or execution progress changed
    OrderUpdate {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Client order id
        client_order_id: String,
        /// Stable state tag
        state: String,
        /// Venue order id, once known
        venue_order_id: Option<String>,
        /// Executed quantity, decimal string
        exec_qty: String,
        /// Weighted average fill price, decimal string
        avg_price: String,
    },
    /// One execution
    Fill {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Client order id
        client_order_id: String,
        /// Venue order id
        venue_order_id: String,
        /// Fill quantity, decimal string
        qty: String,
        /// Fill price, decimal string
        price: String,
        /// Fee in price ticks
        fee: i64,
    },
    /// Reply to a QUERY command
    OrderState {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Client order id
        client_order_id: String,
        /// Stable state tag
        state: String,
        /// Venue order id, once known
        venue_order_id: Option<String>,
        /// Executed quantity, decimal string
        exec_qty: String,
        /// Weighted average fill price, decimal string
        avg_price: String,
    },
    /// Account snapshot after fills
    Account {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Open positions
        positions: Vec<PositionJson>,
        /// Total realized P&L, decimal string
        realized_pnl: String,
        /// Total unrealized P&L, decimal string
        unrealized_pnl: String,
    },
    /// A failure surfaced to the caller
    Error {
        /// Nanosecond timestamp
        ts_ns: u64,
        /// RFC 3339 timestamp
        ts_iso: String,
        /// Stable error code
        code: String,
        /// Human message
        message: String,
        /// Related order id, when known
        client_order_id: Option<String>,
    },
}

/// One position inside an `account` event
#[derive(Debug, Clone, Serialize)]
pub struct PositionJson {
    /// Wire symbol
    pub symbol: String,
    /// Signed quantity, decimal string
    pub qty: String,
    /// Average entry price, decimal string
    pub avg_entry: String,
    /// Realized P&L, decimal string
    pub realized_pnl: String,
    /// Unrealized P&L, decimal string
    pub unrealized_pnl: String,
}

impl OutEvent {
    /// Market-noise events are droppable under backpressure
    #[must_use]
    pub const fn is_droppable(&self) -> bool {
        matches!(self, Self::Market { .. } | Self::BookTop { .. })
    }
}

/// Timestamp pair for event construction
#[must_use]
pub fn stamp(ts: Ts) -> (u64, String) {
    (ts.as_nanos(), ts.to_iso())
}

/// Handle used across the engine to emit events
#[derive(Clone)]
pub struct EventEmitter {
    high_tx: Sender<OutEvent>,
    low_tx: Sender<OutEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    /// Create the emitter plus the writer half
    #[must_use]
    pub fn new() -> (Self, EventWriter) {
        let (high_tx, high_rx) = bounded(QUEUE_BOUND);
        let (low_tx, low_rx) = bounded(QUEUE_BOUND);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Self {
                high_tx,
                low_tx,
                dropped: Arc::clone(&dropped),
            },
            EventWriter {
                high_rx,
                low_rx,
                dropped,
            },
        )
    }

    /// Queue an event for emission
    ///
    /// Order-path events block when the queue is full (backpressure);
    /// market-noise events are dropped with a counter instead.
    pub fn emit(&self, event: OutEvent) {
        if event.is_droppable() {
            if let Err(TrySendError::Full(_)) = self.low_tx.try_send(event) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        } else if self.high_tx.send(event).is_err() {
            warn!("event writer gone; output suppressed");
        }
    }

    /// Events dropped so far under backpressure
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumes queued events and writes NDJSON lines
pub struct EventWriter {
    high_rx: Receiver<OutEvent>,
    low_rx: Receiver<OutEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventWriter {
    /// Run until every sender is dropped; writes to `out`
    pub fn run<W: Write>(self, mut out: W) {
        loop {
            // Prefer order-path events; fall back to market noise.
            let event = match self.high_rx.try_recv() {
                Ok(e) => Some(e),
                Err(_) => match self.low_rx.try_recv() {
                    Ok(e) => Some(e),
                    Err(_) => None,
                },
            };

            match event {
                Some(event) => {
                    if Self::write_line(&mut out, &event).is_err() {
                        return;
                    }
                }
                None => {
                    // Block on whichever queue produces next.
                    crossbeam::channel::select! {
                        recv(self.high_rx) -> msg => match msg {
                            Ok(event) => {
                                if Self::write_line(&mut out, &event).is_err() {
                                    return;
                                }
                            }
                            Err(_) => {
                                // High side closed: drain low then exit.
                                while let Ok(event) = self.low_rx.try_recv() {
                                    let _ = Self::write_line(&mut out, &event);
                                }
                                return;
                            }
                        },
                        recv(self.low_rx) -> msg => {
                            if let Ok(event) = msg {
                                if Self::write_line(&mut out, &event).is_err() {
                                    return;
                                }
                            }
                        },
                    }
                }
            }
        }
    }

    /// Spawn the writer on its own thread targeting stdout
    #[must_use]
    pub fn spawn_stdout(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("event-writer".to_string())
            .spawn(move || self.run(std::io::stdout().lock()))
            .expect("spawn event writer")
    }

    fn write_line<W: Write>(out: &mut W, event: &OutEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }

    /// Drops recorded by the paired emitter
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(code: &str) -> OutEvent {
        let (ts_ns, ts_iso) = stamp(Ts::from_millis(1_700_000_000_000));
        OutEvent::Error {
            ts_ns,
            ts_iso,
            code: code.to_string(),
            message: "m".to_string(),
            client_order_id: None,
        }
    }

    fn ticker_event() -> OutEvent {
        let (ts_ns, ts_iso) = stamp(Ts::from_millis(1));
        OutEvent::BookTop {
            ts_ns,
            ts_iso,
            symbol: "BTCUSDT".to_string(),
            bid: Some("100".to_string()),
            bid_qty: Some("1".to_string()),
            ask: Some("101".to_string()),
            ask_qty: Some("2".to_string()),
        }
    }

    #[test]
    fn events_serialize_with_stable_type_tags() {
        let json = serde_json::to_string(&error_event("parse")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "parse");
        assert!(value["ts_ns"].is_u64());
        assert!(value["ts_iso"].as_str().unwrap().ends_with('Z'));

        let json = serde_json::to_string(&ticker_event()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "book_top");
        assert_eq!(value["symbol"], "BTCUSDT");
    }

    #[test]
    fn writer_outputs_one_json_object_per_line() {
        let (emitter, writer) = EventEmitter::new();
        emitter.emit(error_event("a"));
        emitter.emit(ticker_event());
        emitter.emit(error_event("b"));
        drop(emitter);

        let mut buf = Vec::new();
        writer.run(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["type"].is_string());
        }
    }

    #[test]
    fn droppable_classification() {
        assert!(ticker_event().is_droppable());
        assert!(!error_event("x").is_droppable());
    }
}
