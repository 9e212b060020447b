//! Instrument metadata and symbol interning

use crate::types::{Px, Qty, Symbol, Venue};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Per-symbol wire scale factors, resolved at startup
///
/// Internally all prices and quantities use the canonical 8-decimal scale;
/// these factors describe the venue's tick and step granularity so requests
/// can be validated and rounded at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleInfo {
    /// Number of decimal places the venue quotes prices at
    pub price_decimals: u8,
    /// Number of decimal places the venue accepts quantities at
    pub qty_decimals: u8,
}

impl Default for ScaleInfo {
    fn default() -> Self {
        Self {
            price_decimals: 2,
            qty_decimals: 8,
        }
    }
}

/// Static metadata for one tradable instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Interned id
    pub symbol: Symbol,
    /// Wire name, e.g. `BTCUSDT`
    pub name: String,
    /// Venue the instrument trades on
    pub venue: Venue,
    /// Wire scale factors
    pub scale: ScaleInfo,
    /// Minimum notional accepted by the venue, in price ticks
    pub min_notional: i64,
}

impl Instrument {
    /// Round a price down to the venue's tick grid
    #[must_use]
    pub fn round_price(&self, px: Px) -> Px {
        let grid = 10_i64.pow(8 - u32::from(self.scale.price_decimals.min(8)));
        Px::from_i64(px.as_i64() / grid * grid)
    }

    /// Round a quantity down to the venue's step grid
    #[must_use]
    pub fn round_qty(&self, qty: Qty) -> Qty {
        let grid = 10_i64.pow(8 - u32::from(self.scale.qty_decimals.min(8)));
        Qty::from_i64(qty.as_i64() / grid * grid)
    }
}

/// Thread-safe registry interning wire names to [`Symbol`] ids
///
/// Populated once at startup from configuration; lookups after that are
/// read-locked and cheap.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_name: FxHashMap<String, Symbol>,
    by_id: FxHashMap<Symbol, Instrument>,
    next_id: u32,
}

impl SymbolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument, returning its interned symbol
    ///
    /// Re-registering the same wire name returns the existing id.
    pub fn register(
        &self,
        name: &str,
        venue: Venue,
        scale: ScaleInfo,
        min_notional: i64,
    ) -> Symbol {
        let mut inner = self.inner.write();
        if let Some(sym) = inner.by_name.get(name) {
            return *sym;
        }
        let sym = Symbol::new(inner.next_id);
        inner.next_id += 1;
        inner.by_name.insert(name.to_string(), sym);
        inner.by_id.insert(
            sym,
            Instrument {
                symbol: sym,
                name: name.to_string(),
                venue,
                scale,
                min_notional,
            },
        );
        sym
    }

    /// Resolve a wire name to its symbol
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Fetch instrument metadata for a symbol
    #[must_use]
    pub fn instrument(&self, symbol: Symbol) -> Option<Instrument> {
        self.inner.read().by_id.get(&symbol).cloned()
    }

    /// Wire name for a symbol
    #[must_use]
    pub fn name(&self, symbol: Symbol) -> Option<String> {
        self.inner.read().by_id.get(&symbol).map(|i| i.name.clone())
    }

    /// Number of registered instruments
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// True when no instruments are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let reg = SymbolRegistry::new();
        let btc = reg.register("BTCUSDT", Venue::Binance, ScaleInfo::default(), 0);
        let eth = reg.register("ETHUSDT", Venue::Binance, ScaleInfo::default(), 0);
        assert_ne!(btc, eth);
        assert_eq!(reg.lookup("BTCUSDT"), Some(btc));
        assert_eq!(reg.name(eth).as_deref(), Some("ETHUSDT"));

        // idempotent
        assert_eq!(
            reg.register("BTCUSDT", Venue::Binance, ScaleInfo::default(), 0),
            btc
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn price_rounding_follows_scale() {
        let inst = Instrument {
            symbol: Symbol::new(0),
            name: "BTCUSDT".into(),
            venue: Venue::Binance,
            scale: ScaleInfo {
                price_decimals: 2,
                qty_decimals: 3,
            },
            min_notional: 0,
        };
        let px = Px::parse("123.456789").unwrap();
        assert_eq!(inst.round_price(px).to_decimal_string(), "123.45");
        let qty = Qty::parse("0.123456").unwrap();
        assert_eq!(inst.round_qty(qty).to_decimal_string(), "0.123");
    }
}
