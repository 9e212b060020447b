//! Core fixed-point and identifier types for the Quasar engine

use crate::constants::fixed_point::SCALE_8;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interned symbol identifier for trading instruments
///
/// The numeric id is assigned by the [`crate::instrument::SymbolRegistry`]
/// at startup; wire names (`"BTCUSDT"`) never travel on hot paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub u32);

impl Symbol {
    /// Create a new Symbol with the given id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SYM_{}", self.0)
    }
}

/// Exchange venue tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Binance spot/futures
    Binance,
    /// OKX
    Okx,
    /// Bybit
    Bybit,
    /// Coinbase
    Coinbase,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Bybit => "bybit",
            Self::Coinbase => "coinbase",
        };
        f.write_str(s)
    }
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "okx" => Ok(Self::Okx),
            "bybit" => Ok(Self::Bybit),
            "coinbase" => Ok(Self::Coinbase),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

/// Trading side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy side (bid)
    Buy,
    /// Sell side (ask)
    Sell,
}

impl Side {
    /// Sign multiplier: +1 for buys, -1 for sells
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    /// The opposing side
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// Price in canonical fixed-point ticks (8 implied decimals)
///
/// All arithmetic on the order path is exact integer arithmetic; floats
/// appear only at wire boundaries via [`Px::as_f64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64);

impl Px {
    /// Zero price
    pub const ZERO: Self = Self(0);

    /// Create from raw ticks
    #[must_use]
    pub const fn from_i64(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Raw ticks
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Parse a decimal wire string ("50000.25") into ticks
    ///
    /// Exact: no float round-trip. Fails on malformed input or more than
    /// 8 fractional digits.
    pub fn parse(s: &str) -> Result<Self, ParseFixedError> {
        parse_fixed(s).map(Self)
    }

    /// Convert to f64 for display and wire formatting only
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.0 as f64 / SCALE_8 as f64
        }
    }

    /// Saturating add
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtract
    #[must_use]
    pub const fn sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Notional value of `self * qty`, in price ticks
    ///
    /// Widens to i128 internally so large crypto notionals cannot overflow.
    #[must_use]
    pub fn mul_qty(self, qty: Qty) -> i64 {
        let wide = i128::from(self.0) * i128::from(qty.0) / i128::from(SCALE_8);
        i64::try_from(wide).unwrap_or(i64::MAX)
    }

    /// Render as a plain decimal string with trailing zeros trimmed
    #[must_use]
    pub fn to_decimal_string(&self) -> String {
        format_fixed(self.0)
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

/// Quantity in canonical fixed-point units (8 implied decimals)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(i64);

impl Qty {
    /// Zero quantity
    pub const ZERO: Self = Self(0);

    /// Create from raw units
    #[must_use]
    pub const fn from_i64(units: i64) -> Self {
        Self(units)
    }

    /// Raw units
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Parse a decimal wire string ("0.001") into units
    pub fn parse(s: &str) -> Result<Self, ParseFixedError> {
        parse_fixed(s).map(Self)
    }

    /// Convert to f64 for display and wire formatting only
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.0 as f64 / SCALE_8 as f64
        }
    }

    /// True when zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Saturating add
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtract
    #[must_use]
    pub const fn sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Smaller of two quantities
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Render as a plain decimal string with trailing zeros trimmed
    #[must_use]
    pub fn to_decimal_string(&self) -> String {
        format_fixed(self.0)
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

/// Nanosecond timestamp since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ts(u64);

impl Ts {
    /// Create from nanoseconds
    #[must_use]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from milliseconds
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    /// Nanoseconds since epoch
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Milliseconds since epoch
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Saturating difference in nanoseconds
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// RFC 3339 rendering with millisecond precision and `Z` suffix
    #[must_use]
    pub fn to_iso(&self) -> String {
        let secs = (self.0 / 1_000_000_000) as i64;
        let nanos = (self.0 % 1_000_000_000) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-assigned idempotent order identifier (<= 36 chars, `[A-Za-z0-9_-]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Maximum identifier length accepted by the engine
    pub const MAX_LEN: usize = 36;

    /// Validate and wrap a raw identifier
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidClientOrderId> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(InvalidClientOrderId(raw));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(InvalidClientOrderId(raw));
        }
        Ok(Self(raw))
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejection for a malformed client order id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidClientOrderId(pub String);

impl fmt::Display for InvalidClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid client order id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidClientOrderId {}

/// Exchange-assigned order identifier, opaque to the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VenueOrderId(pub String);

impl VenueOrderId {
    /// Wrap a raw venue identifier
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error parsing a fixed-point decimal string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFixedError(pub String);

impl fmt::Display for ParseFixedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal: {:?}", self.0)
    }
}

impl std::error::Error for ParseFixedError {}

/// Parse a decimal string into 8-decimal fixed-point ticks without floats
fn parse_fixed(s: &str) -> Result<i64, ParseFixedError> {
    let err = || ParseFixedError(s.to_string());
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body.is_empty() {
        return Err(err());
    }
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(err());
    }
    if frac_part.len() > 8 {
        return Err(err());
    }
    let int_val: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| err())?
    };
    let mut frac_val: i64 = 0;
    for b in frac_part.bytes() {
        if !b.is_ascii_digit() {
            return Err(err());
        }
        frac_val = frac_val * 10 + i64::from(b - b'0');
    }
    for _ in frac_part.len()..8 {
        frac_val *= 10;
    }
    let ticks = int_val
        .checked_mul(SCALE_8)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(err)?;
    Ok(if neg { -ticks } else { ticks })
}

/// Format fixed-point ticks as a decimal string, trimming trailing zeros
fn format_fixed(ticks: i64) -> String {
    let neg = ticks < 0;
    let abs = ticks.unsigned_abs();
    let int_part = abs / SCALE_8 as u64;
    let frac_part = abs % SCALE_8 as u64;
    let mut out = String::new();
    if neg {
        out.push('-');
    }
    if frac_part == 0 {
        out.push_str(&int_part.to_string());
    } else {
        let frac = format!("{frac_part:08}");
        let trimmed = frac.trim_end_matches('0');
        out.push_str(&format!("{int_part}.{trimmed}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parse_round_trips() {
        let px = Px::parse("50000.25").unwrap();
        assert_eq!(px.as_i64(), 5_000_025_000_000);
        assert_eq!(px.to_decimal_string(), "50000.25");

        let qty = Qty::parse("0.001").unwrap();
        assert_eq!(qty.as_i64(), 100_000);
        assert_eq!(qty.to_decimal_string(), "0.001");

        assert_eq!(Px::parse("-1.5").unwrap().as_i64(), -150_000_000);
        assert_eq!(Qty::parse("7").unwrap().as_i64(), 700_000_000);
    }

    #[rstest]
    #[case::empty("")]
    #[case::alpha("abc")]
    #[case::two_dots("1.2.3")]
    #[case::nine_fraction_digits("1.123456789")]
    #[case::bare_sign("-")]
    fn parse_rejects_garbage(#[case] raw: &str) {
        assert!(Px::parse(raw).is_err());
        assert!(Qty::parse(raw).is_err());
    }

    #[test]
    fn notional_uses_wide_intermediate() {
        // 50_000 * 100 would overflow a naive i64 tick product
        let px = Px::parse("50000").unwrap();
        let qty = Qty::parse("100").unwrap();
        assert_eq!(px.mul_qty(qty), 5_000_000 * SCALE_8);
    }

    #[test]
    fn client_order_id_validation() {
        assert!(ClientOrderId::new("c1").is_ok());
        assert!(ClientOrderId::new("abc_DEF-123").is_ok());
        assert!(ClientOrderId::new("").is_err());
        assert!(ClientOrderId::new("a".repeat(37)).is_err());
        assert!(ClientOrderId::new("bad id").is_err());
        assert!(ClientOrderId::new("bad!id").is_err());
    }

    #[test]
    fn ts_iso_rendering() {
        let ts = Ts::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_iso(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn venue_round_trip() {
        for v in [Venue::Binance, Venue::Okx, Venue::Bybit, Venue::Coinbase] {
            assert_eq!(v.to_string().parse::<Venue>().unwrap(), v);
        }
        assert!("ftx".parse::<Venue>().is_err());
    }
}
