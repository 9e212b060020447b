//! Canonical market data events flowing through the engine

use crate::types::{Px, Qty, Side, Symbol, Ts, Venue};
use serde::{Deserialize, Serialize};

/// Market stream kinds a consumer can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Individual trades
    Trade,
    /// Incremental depth deltas
    Depth,
    /// Full book snapshots
    Snapshot,
    /// Aggregated candles
    Kline,
    /// Top-of-book ticker
    Ticker,
}

/// One trade print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Trade price
    pub price: Px,
    /// Trade quantity
    pub qty: Qty,
    /// Aggressor side
    pub side: Side,
}

/// One price level change (absolute replace; qty 0 removes the level)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Book side the level belongs to
    pub side: Side,
    /// Price level
    pub price: Px,
    /// New absolute quantity at the level
    pub qty: Qty,
}

/// Full book snapshot payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Exchange snapshot sequence; deltas with `seq <= snapshot_seq` are stale
    pub snapshot_seq: u64,
    /// Bid levels, best first
    pub bids: Vec<(Px, Qty)>,
    /// Ask levels, best first
    pub asks: Vec<(Px, Qty)>,
}

/// Closed or in-progress OHLCV candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineData {
    /// Window open time
    pub open_time: Ts,
    /// Window length in milliseconds
    pub period_ms: u64,
    /// Open price
    pub open: Px,
    /// High price
    pub high: Px,
    /// Low price
    pub low: Px,
    /// Close price
    pub close: Px,
    /// Total base volume
    pub volume: Qty,
    /// Volume-weighted average price over the window
    pub vwap: Px,
    /// Number of trades folded into the candle
    pub trades: u32,
}

/// Top-of-book ticker payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerData {
    /// Best bid price and size
    pub bid: Option<(Px, Qty)>,
    /// Best ask price and size
    pub ask: Option<(Px, Qty)>,
    /// Last trade price
    pub last: Option<Px>,
}

/// Payload carried by a [`MarketEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPayload {
    /// Trade print
    Trade(TradeEvent),
    /// Incremental depth change, one or more levels
    BookDelta(Vec<BookDelta>),
    /// Full snapshot
    BookSnapshot(BookSnapshot),
    /// Candle
    Kline(KlineData),
    /// Ticker
    Ticker(TickerData),
}

impl MarketPayload {
    /// The stream kind this payload belongs to
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        match self {
            Self::Trade(_) => StreamKind::Trade,
            Self::BookDelta(_) => StreamKind::Depth,
            Self::BookSnapshot(_) => StreamKind::Snapshot,
            Self::Kline(_) => StreamKind::Kline,
            Self::Ticker(_) => StreamKind::Ticker,
        }
    }
}

/// A normalized market data event
///
/// `ts_recv` is monotone per (venue, symbol); `seq` is monotone per feed.
/// Events are created by the feed decoder and consumed within one market
/// dispatcher tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Instrument the event refers to
    pub symbol: Symbol,
    /// Venue the event originated from
    pub venue: Venue,
    /// Feed sequence number
    pub seq: u64,
    /// Exchange-supplied event time
    pub ts_exchange: Ts,
    /// Local receive time
    pub ts_recv: Ts,
    /// Event payload
    pub payload: MarketPayload,
}

/// Copy of the top of book handed to strategies and the risk engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookTop {
    /// Best bid price and size
    pub bid: Option<(Px, Qty)>,
    /// Best ask price and size
    pub ask: Option<(Px, Qty)>,
    /// Snapshot time
    pub ts: Ts,
}

impl BookTop {
    /// Mid price when both sides exist
    #[must_use]
    pub fn mid(&self) -> Option<Px> {
        match (self.bid, self.ask) {
            (Some((b, _)), Some((a, _))) => Some(Px::from_i64((b.as_i64() + a.as_i64()) / 2)),
            _ => None,
        }
    }

    /// Spread in ticks when both sides exist
    #[must_use]
    pub fn spread(&self) -> Option<i64> {
        match (self.bid, self.ask) {
            (Some((b, _)), Some((a, _))) => Some(a.as_i64() - b.as_i64()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_mapping() {
        let trade = MarketPayload::Trade(TradeEvent {
            price: Px::from_i64(1),
            qty: Qty::from_i64(1),
            side: Side::Buy,
        });
        assert_eq!(trade.kind(), StreamKind::Trade);

        let snap = MarketPayload::BookSnapshot(BookSnapshot {
            snapshot_seq: 7,
            bids: vec![],
            asks: vec![],
        });
        assert_eq!(snap.kind(), StreamKind::Snapshot);
    }

    #[test]
    fn book_top_mid_and_spread() {
        let top = BookTop {
            bid: Some((Px::from_i64(100), Qty::from_i64(1))),
            ask: Some((Px::from_i64(104), Qty::from_i64(2))),
            ts: Ts::from_nanos(0),
        };
        assert_eq!(top.mid(), Some(Px::from_i64(102)));
        assert_eq!(top.spread(), Some(4));

        let empty = BookTop::default();
        assert_eq!(empty.mid(), None);
        assert_eq!(empty.spread(), None);
    }
}
