//! Core order book implementation
//!
//! Sorted bid/ask ladders applied in strict sequence order. A gap marks
//! the book invalid and buffers deltas until a snapshot covering the gap
//! arrives, at which point buffered deltas replay forward.

use common::{BookDelta, BookSnapshot, BookTop, Px, Qty, Side, Symbol, Ts};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on deltas buffered while awaiting a snapshot
const MAX_BUFFERED: usize = 4_096;

/// Order book failure modes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    /// Best bid crossed best ask after an update
    #[error("crossed book: bid {bid:?} >= ask {ask:?}")]
    Crossed {
        /// Best bid at detection
        bid: Option<Px>,
        /// Best ask at detection
        ask: Option<Px>,
    },
    /// Delta buffer overflowed while waiting for a snapshot
    #[error("delta buffer overflow awaiting snapshot")]
    BufferOverflow,
}

/// Result of feeding one delta batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied in sequence
    Applied,
    /// Stale (seq at or below the book); dropped
    Stale,
    /// Book is invalid; delta buffered until a snapshot arrives
    Buffered,
    /// Sequence gap detected; book invalidated, delta buffered
    GapDetected {
        /// Sequence the book would have accepted
        expected: u64,
        /// Sequence received
        got: u64,
    },
}

#[derive(Debug, Clone)]
struct BufferedDeltas {
    seq: u64,
    deltas: Vec<BookDelta>,
    ts: Ts,
}

/// One side of the book: price ticks -> (qty, update seq)
type Ladder = BTreeMap<i64, (Qty, u64)>;

/// Sequence-validated order book for a single symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Symbol this book represents
    pub symbol: Symbol,
    bids: Ladder,
    asks: Ladder,
    last_seq: u64,
    snapshot_valid: bool,
    buffered: VecDeque<BufferedDeltas>,
    ts: Ts,
    /// Deltas dropped for staleness
    pub stale_dropped: u64,
}

impl OrderBook {
    /// Create an empty, invalid book; a snapshot must seed it
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: Ladder::new(),
            asks: Ladder::new(),
            last_seq: 0,
            snapshot_valid: false,
            buffered: VecDeque::new(),
            ts: Ts::from_nanos(0),
            stale_dropped: 0,
        }
    }

    /// Whether the book currently reflects a contiguous feed
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.snapshot_valid
    }

    /// Sequence of the last applied update
    #[must_use]
    pub const fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of deltas parked while awaiting a snapshot
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Apply a delta batch carrying feed sequence `seq`
    ///
    /// Accepted iff `seq == last_seq + 1` on a valid book. A gap flips
    /// the book invalid and parks the batch; the caller should request a
    /// snapshot.
    pub fn apply_deltas(
        &mut self,
        seq: u64,
        deltas: &[BookDelta],
        ts: Ts,
    ) -> Result<ApplyOutcome, BookError> {
        if !self.snapshot_valid {
            self.buffer(seq, deltas, ts)?;
            return Ok(ApplyOutcome::Buffered);
        }

        if seq <= self.last_seq {
            self.stale_dropped += 1;
            return Ok(ApplyOutcome::Stale);
        }

        if seq != self.last_seq + 1 {
            let expected = self.last_seq + 1;
            warn!(
                symbol = %self.symbol,
                expected,
                got = seq,
                "sequence gap; invalidating book"
            );
            self.snapshot_valid = false;
            self.buffer(seq, deltas, ts)?;
            return Ok(ApplyOutcome::GapDetected { expected, got: seq });
        }

        self.apply_levels(seq, deltas, ts)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Seed the book from a snapshot and replay buffered deltas
    ///
    /// Buffered deltas at or below `snapshot_seq` are discarded; the rest
    /// replay forward in sequence order. If the replay run is not
    /// contiguous with the snapshot, the book stays invalid and keeps its
    /// buffer so a newer snapshot can be requested.
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot, ts: Ts) -> Result<(), BookError> {
        self.bids.clear();
        self.asks.clear();
        for (price, qty) in &snapshot.bids {
            if !qty.is_zero() {
                self.bids.insert(price.as_i64(), (*qty, snapshot.snapshot_seq));
            }
        }
        for (price, qty) in &snapshot.asks {
            if !qty.is_zero() {
                self.asks.insert(price.as_i64(), (*qty, snapshot.snapshot_seq));
            }
        }
        self.last_seq = snapshot.snapshot_seq;
        self.ts = ts;
        self.snapshot_valid = true;

        // Drop deltas the snapshot already covers.
        let mut parked: Vec<BufferedDeltas> = self
            .buffered
            .drain(..)
            .filter(|b| b.seq > snapshot.snapshot_seq)
            .collect();
        parked.sort_by_key(|b| b.seq);

        for batch in parked {
            if batch.seq != self.last_seq + 1 {
                // Replay run is broken; park the remainder and go invalid.
                warn!(
                    symbol = %self.symbol,
                    expected = self.last_seq + 1,
                    got = batch.seq,
                    "snapshot does not cover buffered gap"
                );
                self.snapshot_valid = false;
                self.buffered.push_back(batch);
                continue;
            }
            self.apply_levels(batch.seq, &batch.deltas, batch.ts)?;
        }

        if self.snapshot_valid {
            debug!(
                symbol = %self.symbol,
                seq = self.last_seq,
                "book rebuilt from snapshot"
            );
        }
        if self.is_crossed() {
            self.snapshot_valid = false;
            return Err(BookError::Crossed {
                bid: self.best_bid().map(|(p, _)| p),
                ask: self.best_ask().map(|(p, _)| p),
            });
        }
        Ok(())
    }

    fn buffer(&mut self, seq: u64, deltas: &[BookDelta], ts: Ts) -> Result<(), BookError> {
        if self.buffered.len() >= MAX_BUFFERED {
            return Err(BookError::BufferOverflow);
        }
        self.buffered.push_back(BufferedDeltas {
            seq,
            deltas: deltas.to_vec(),
            ts,
        });
        Ok(())
    }

    fn apply_levels(&mut self, seq: u64, deltas: &[BookDelta], ts: Ts) -> Result<(), BookError> {
        for delta in deltas {
            let ladder = match delta.side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            if delta.qty.is_zero() {
                ladder.remove(&delta.price.as_i64());
            } else {
                ladder.insert(delta.price.as_i64(), (delta.qty, seq));
            }
        }
        self.last_seq = seq;
        self.ts = ts;

        if self.is_crossed() {
            self.snapshot_valid = false;
            return Err(BookError::Crossed {
                bid: self.best_bid().map(|(p, _)| p),
                ask: self.best_ask().map(|(p, _)| p),
            });
        }
        Ok(())
    }

    /// Highest bid
    #[must_use]
    pub fn best_bid(&self) -> Option<(Px, Qty)> {
        self.bids
            .iter()
            .next_back()
            .map(|(p, (q, _))| (Px::from_i64(*p), *q))
    }

    /// Lowest ask
    #[must_use]
    pub fn best_ask(&self) -> Option<(Px, Qty)> {
        self.asks
            .iter()
            .next()
            .map(|(p, (q, _))| (Px::from_i64(*p), *q))
    }

    /// Mid price; defined only when both sides are non-empty
    #[must_use]
    pub fn mid(&self) -> Option<Px> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => {
                Some(Px::from_i64((bid.as_i64() + ask.as_i64()) / 2))
            }
            _ => None,
        }
    }

    /// Spread in ticks; defined only when both sides are non-empty
    #[must_use]
    pub fn spread(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask.as_i64() - bid.as_i64()),
            _ => None,
        }
    }

    /// Bid/ask volume imbalance over the top `depth` levels, in [-1, 1]
    #[must_use]
    pub fn imbalance(&self, depth: usize) -> Option<f64> {
        let bid_qty: i64 = self
            .bids
            .values()
            .rev()
            .take(depth)
            .map(|(q, _)| q.as_i64())
            .sum();
        let ask_qty: i64 = self
            .asks
            .values()
            .take(depth)
            .map(|(q, _)| q.as_i64())
            .sum();
        let total = bid_qty + ask_qty;
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            Some((bid_qty - ask_qty) as f64 / total as f64)
        } else {
            None
        }
    }

    /// True when best bid >= best ask
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Copyable top-of-book snapshot for cross-dispatcher reads
    #[must_use]
    pub fn top(&self) -> BookTop {
        BookTop {
            bid: self.best_bid(),
            ask: self.best_ask(),
            ts: self.ts,
        }
    }

    /// Number of populated levels (bids, asks)
    #[must_use]
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(v: &str) -> Px {
        Px::parse(v).unwrap()
    }

    fn qty(v: &str) -> Qty {
        Qty::parse(v).unwrap()
    }

    fn delta(side: Side, price: &str, q: &str) -> BookDelta {
        BookDelta {
            side,
            price: px(price),
            qty: qty(q),
        }
    }

    fn seeded_book() -> OrderBook {
        let mut book = OrderBook::new(Symbol::new(1));
        book.apply_snapshot(
            &BookSnapshot {
                snapshot_seq: 100,
                bids: vec![(px("99"), qty("1")), (px("98"), qty("2"))],
                asks: vec![(px("101"), qty("1")), (px("102"), qty("2"))],
            },
            Ts::from_nanos(1),
        )
        .unwrap();
        book
    }

    #[test]
    fn in_order_deltas_apply() {
        let mut book = seeded_book();
        assert_eq!(
            book.apply_deltas(101, &[delta(Side::Buy, "99.5", "3")], Ts::from_nanos(2))
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(book.last_seq(), 101);
        assert_eq!(book.best_bid(), Some((px("99.5"), qty("3"))));
    }

    #[test]
    fn zero_qty_removes_level() {
        let mut book = seeded_book();
        book.apply_deltas(101, &[delta(Side::Sell, "101", "0")], Ts::from_nanos(2))
            .unwrap();
        assert_eq!(book.best_ask(), Some((px("102"), qty("2"))));
    }

    #[test]
    fn stale_deltas_dropped() {
        let mut book = seeded_book();
        assert_eq!(
            book.apply_deltas(100, &[delta(Side::Buy, "99", "9")], Ts::from_nanos(2))
                .unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(book.best_bid(), Some((px("99"), qty("1"))));
        assert_eq!(book.stale_dropped, 1);
    }

    #[test]
    fn gap_invalidates_and_buffers() {
        let mut book = seeded_book();
        book.apply_deltas(101, &[delta(Side::Buy, "99", "5")], Ts::from_nanos(2))
            .unwrap();
        let out = book
            .apply_deltas(103, &[delta(Side::Buy, "99", "7")], Ts::from_nanos(3))
            .unwrap();
        assert_eq!(
            out,
            ApplyOutcome::GapDetected {
                expected: 102,
                got: 103
            }
        );
        assert!(!book.is_valid());
        assert_eq!(book.buffered_len(), 1);

        // Further deltas buffer while invalid.
        assert_eq!(
            book.apply_deltas(104, &[delta(Side::Buy, "99", "8")], Ts::from_nanos(4))
                .unwrap(),
            ApplyOutcome::Buffered
        );
        assert_eq!(book.buffered_len(), 2);
    }

    #[test]
    fn snapshot_replays_buffered_deltas() {
        // Mirrors the gap scenario: deltas 100..=101 applied, 103 gapped,
        // then snapshot 110 plus buffered 104..=110 replayed forward.
        let mut book = seeded_book();
        book.apply_deltas(101, &[delta(Side::Buy, "99", "5")], Ts::from_nanos(2))
            .unwrap();
        book.apply_deltas(103, &[delta(Side::Buy, "99", "7")], Ts::from_nanos(3))
            .unwrap();
        for seq in 104..=110 {
            book.apply_deltas(
                seq,
                &[delta(Side::Sell, "101", &format!("{}", seq - 100))],
                Ts::from_nanos(seq),
            )
            .unwrap();
        }

        book.apply_snapshot(
            &BookSnapshot {
                snapshot_seq: 110,
                bids: vec![(px("99"), qty("4"))],
                asks: vec![(px("101"), qty("9"))],
            },
            Ts::from_nanos(20),
        )
        .unwrap();

        // Buffered 103..=110 were all covered by the snapshot.
        assert!(book.is_valid());
        assert_eq!(book.last_seq(), 110);
        assert_eq!(book.best_bid(), Some((px("99"), qty("4"))));
        assert_eq!(book.best_ask(), Some((px("101"), qty("9"))));
        assert_eq!(book.buffered_len(), 0);
    }

    #[test]
    fn snapshot_with_pending_tail_replays_forward() {
        let mut book = seeded_book();
        // Gap at 102; 103..=105 buffer.
        for seq in 103..=105 {
            book.apply_deltas(
                seq,
                &[delta(Side::Buy, "99", &format!("{}", seq - 100))],
                Ts::from_nanos(seq),
            )
            .unwrap();
        }
        assert!(!book.is_valid());

        // Snapshot at 102 covers the gap; 103..=105 replay on top.
        book.apply_snapshot(
            &BookSnapshot {
                snapshot_seq: 102,
                bids: vec![(px("99"), qty("1"))],
                asks: vec![(px("101"), qty("1"))],
            },
            Ts::from_nanos(10),
        )
        .unwrap();
        assert!(book.is_valid());
        assert_eq!(book.last_seq(), 105);
        assert_eq!(book.best_bid(), Some((px("99"), qty("5"))));
    }

    #[test]
    fn insufficient_snapshot_keeps_book_invalid() {
        let mut book = seeded_book();
        book.apply_deltas(105, &[delta(Side::Buy, "99", "5")], Ts::from_nanos(2))
            .unwrap();
        assert!(!book.is_valid());

        // Snapshot at 102 leaves a hole before the buffered 105.
        book.apply_snapshot(
            &BookSnapshot {
                snapshot_seq: 102,
                bids: vec![(px("99"), qty("1"))],
                asks: vec![(px("101"), qty("1"))],
            },
            Ts::from_nanos(10),
        )
        .unwrap();
        assert!(!book.is_valid());
        assert_eq!(book.buffered_len(), 1);
    }

    #[test]
    fn crossed_book_detected() {
        let mut book = seeded_book();
        let err = book
            .apply_deltas(101, &[delta(Side::Buy, "101.5", "1")], Ts::from_nanos(2))
            .unwrap_err();
        assert!(matches!(err, BookError::Crossed { .. }));
        assert!(!book.is_valid());
    }

    #[test]
    fn spread_and_mid_need_both_sides() {
        let mut book = OrderBook::new(Symbol::new(2));
        book.apply_snapshot(
            &BookSnapshot {
                snapshot_seq: 1,
                bids: vec![(px("10"), qty("1"))],
                asks: vec![],
            },
            Ts::from_nanos(1),
        )
        .unwrap();
        assert_eq!(book.spread(), None);
        assert_eq!(book.mid(), None);

        book.apply_deltas(2, &[delta(Side::Sell, "12", "1")], Ts::from_nanos(2))
            .unwrap();
        assert_eq!(book.spread(), Some(px("2").as_i64()));
        assert_eq!(book.mid(), Some(px("11")));
    }

    #[test]
    fn imbalance_over_top_levels() {
        let book = seeded_book();
        // depth 1: bid 1 vs ask 1 -> 0
        assert_eq!(book.imbalance(1), Some(0.0));
        // all levels: bids 3 vs asks 3 -> 0
        assert_eq!(book.imbalance(10), Some(0.0));
    }
}
