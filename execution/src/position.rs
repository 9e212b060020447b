//! Position and P&L bookkeeping
//!
//! One signed position per symbol. Same-side fills extend the position
//! at a weighted average entry; opposite-side fills realize P&L on the
//! closed portion net of fees, and a sign flip opens a fresh position at
//! the fill price. Unrealized P&L recomputes on each mark update. All
//! arithmetic is fixed-point with i128 intermediates.

use common::{Px, Qty, Side, Symbol, Ts};
use common::constants::fixed_point::SCALE_8;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One symbol's position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument
    pub symbol: Symbol,
    /// Signed quantity units; positive = long
    pub qty: i64,
    /// Average entry price; meaningless when flat
    pub avg_entry: Px,
    /// Cumulative realized P&L in price ticks, net of fees
    pub realized_pnl: i64,
    /// Mark-to-market P&L in price ticks
    pub unrealized_pnl: i64,
    /// Last update time
    pub last_update: Ts,
}

impl Position {
    fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            qty: 0,
            avg_entry: Px::ZERO,
            realized_pnl: 0,
            unrealized_pnl: 0,
            last_update: Ts::from_nanos(0),
        }
    }

    /// True when no exposure
    #[must_use]
    pub const fn is_flat(&self) -> bool {
        self.qty == 0
    }
}

/// All positions, owned by the order dispatcher
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: FxHashMap<Symbol, Position>,
}

impl PositionBook {
    /// Create an empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position for a symbol (flat default)
    #[must_use]
    pub fn get(&self, symbol: Symbol) -> Position {
        self.positions
            .get(&symbol)
            .copied()
            .unwrap_or_else(|| Position::flat(symbol))
    }

    /// All non-flat positions
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .copied()
            .collect();
        out.sort_by_key(|p| p.symbol);
        out
    }

    /// Apply one fill; returns the updated position
    ///
    /// `fee` is in price ticks and reduces realized P&L.
    pub fn on_fill(
        &mut self,
        symbol: Symbol,
        side: Side,
        qty: Qty,
        price: Px,
        fee: i64,
        ts: Ts,
    ) -> Position {
        let pos = self
            .positions
            .entry(symbol)
            .or_insert_with(|| Position::flat(symbol));

        let fill_qty = qty.as_i64();
        let signed_fill = side.sign() * fill_qty;

        if pos.qty == 0 || pos.qty.signum() == signed_fill.signum() {
            // Extending (or opening): weighted average entry.
            let old_notional = i128::from(pos.avg_entry.as_i64()) * i128::from(pos.qty.abs());
            let add_notional = i128::from(price.as_i64()) * i128::from(fill_qty);
            let new_abs = pos.qty.abs() + fill_qty;
            let avg = (old_notional + add_notional) / i128::from(new_abs);
            pos.avg_entry = Px::from_i64(i64::try_from(avg).unwrap_or(i64::MAX));
            pos.qty += signed_fill;
        } else {
            // Reducing: realize on the closed portion.
            let closed = fill_qty.min(pos.qty.abs());
            let side_sign = i128::from(pos.qty.signum());
            let pnl =
                (i128::from(price.as_i64()) - i128::from(pos.avg_entry.as_i64()))
                    * i128::from(closed)
                    * side_sign
                    / i128::from(SCALE_8);
            pos.realized_pnl += i64::try_from(pnl).unwrap_or(0);

            let remainder = fill_qty - closed;
            pos.qty += signed_fill;
            if remainder > 0 {
                // Flip: the leftover opens a new position at fill price.
                pos.avg_entry = price;
            } else if pos.qty == 0 {
                pos.avg_entry = Px::ZERO;
                pos.unrealized_pnl = 0;
            }
        }

        pos.realized_pnl -= fee;
        pos.last_update = ts;
        *pos
    }

    /// Recompute unrealized P&L for a symbol at a mark price
    pub fn on_mark(&mut self, symbol: Symbol, mark: Px, ts: Ts) -> Option<Position> {
        let pos = self.positions.get_mut(&symbol)?;
        if pos.is_flat() {
            pos.unrealized_pnl = 0;
            return Some(*pos);
        }
        let pnl = (i128::from(mark.as_i64()) - i128::from(pos.avg_entry.as_i64()))
            * i128::from(pos.qty)
            / i128::from(SCALE_8);
        pos.unrealized_pnl = i64::try_from(pnl).unwrap_or(0);
        pos.last_update = ts;
        Some(*pos)
    }

    /// Total realized P&L across symbols, ticks
    #[must_use]
    pub fn total_realized(&self) -> i64 {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Total unrealized P&L across symbols, ticks
    #[must_use]
    pub fn total_unrealized(&self) -> i64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Restore a position snapshot (recovery path)
    pub fn restore(&mut self, position: Position) {
        self.positions.insert(position.symbol, position);
    }
}
