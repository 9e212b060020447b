//! Engine configuration
//!
//! Loaded once at startup from an optional TOML file layered with
//! `QUASAR_`-prefixed environment overrides. Unknown keys are rejected at
//! load time. Credentials come only from the environment and are redacted
//! in `Debug` output.

use crate::retry::RetryPolicy;
use crate::types::Venue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Clock synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClockConfig {
    /// Time servers probed for offset calibration
    pub ntp_servers: Vec<String>,
    /// Probe interval
    pub poll_interval_ms: u64,
    /// Probes beyond this offset are discarded
    pub max_offset_ns: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ntp_servers: vec!["time.google.com".to_string()],
            poll_interval_ms: 60_000,
            max_offset_ns: 5_000_000_000,
        }
    }
}

/// WAL durability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncMode {
    /// fsync on every flush; durable
    Fsync,
    /// flush without fsync; caller accepts a loss window
    Async,
}

/// Write-ahead log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WalConfig {
    /// Journaling on/off
    pub enabled: bool,
    /// Directory for segment files
    pub dir: String,
    /// Durability mode
    pub sync_mode: WalSyncMode,
    /// Segment rollover threshold in bytes
    pub max_segment_bytes: u64,
    /// Batched-write flush interval
    pub flush_interval_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "./wal".to_string(),
            sync_mode: WalSyncMode::Fsync,
            max_segment_bytes: 128 * 1024 * 1024,
            flush_interval_ms: 5,
        }
    }
}

/// Per-venue order routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VenueRouterConfig {
    /// Token bucket capacity
    pub rate_capacity: u64,
    /// Token refill rate per second
    pub rate_refill_per_sec: u64,
    /// Deadline for one adapter call
    pub request_timeout_ms: u64,
    /// Retry budget for retryable failures
    pub max_retries: u32,
}

impl Default for VenueRouterConfig {
    fn default() -> Self {
        Self {
            rate_capacity: 10,
            rate_refill_per_sec: 10,
            request_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

/// Router settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RouterConfig {
    /// Per-venue overrides; venues absent here use the defaults
    pub venues: BTreeMap<String, VenueRouterConfig>,
    /// Backoff policy for retryable adapter failures
    pub retry: RetryPolicy,
}

impl RouterConfig {
    /// Settings for a venue, falling back to defaults
    #[must_use]
    pub fn venue(&self, venue: Venue) -> VenueRouterConfig {
        self.venues
            .get(&venue.to_string())
            .cloned()
            .unwrap_or_default()
    }
}

/// Pre-trade risk limits; fixed-point tick values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskConfig {
    /// Max absolute position per symbol, quantity units
    pub max_position_size: i64,
    /// Max notional per order, price ticks
    pub max_notional: i64,
    /// Max `|price - mid| / mid`, in basis points
    pub price_deviation_bps: i64,
    /// Orders per rolling second per symbol
    pub rate_per_symbol: u32,
    /// Daily loss limit, price ticks; breach enters cancel-only mode
    pub daily_loss: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: i64::MAX,
            max_notional: i64::MAX,
            price_deviation_bps: 1_000,
            rate_per_symbol: 10,
            daily_loss: i64::MAX,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitConfig {
    /// Consecutive adapter errors before opening
    pub error_threshold: u64,
    /// Realized loss per window before opening, price ticks
    pub loss_threshold: i64,
    /// Cooldown before a half-open probe
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            loss_threshold: i64::MAX,
            cooldown_ms: 30_000,
        }
    }
}

/// One configured strategy instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    /// Unique instance id
    pub id: String,
    /// Built-in template tag
    pub type_tag: String,
    /// Template-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Per-symbol market data settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketSymbolConfig {
    /// Venue the symbol streams from
    pub venue: String,
    /// Stream kinds to subscribe
    #[serde(default = "default_stream_kinds")]
    pub stream_kinds: Vec<String>,
    /// Kline periods in milliseconds
    #[serde(default)]
    pub kline_periods_ms: Vec<u64>,
    /// Venue price decimals
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u8,
    /// Venue quantity decimals
    #[serde(default = "default_qty_decimals")]
    pub qty_decimals: u8,
}

fn default_stream_kinds() -> Vec<String> {
    vec!["trade".to_string(), "depth".to_string()]
}

const fn default_price_decimals() -> u8 {
    2
}

const fn default_qty_decimals() -> u8 {
    8
}

/// Root engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Clock synchronization
    pub clock: ClockConfig,
    /// Write-ahead log
    pub wal: WalConfig,
    /// Order routing
    pub router: RouterConfig,
    /// Pre-trade risk
    pub risk: RiskConfig,
    /// Circuit breaker
    pub circuit: CircuitConfig,
    /// Strategy instances
    pub strategy: Vec<StrategyConfig>,
    /// Market data, keyed by wire symbol name
    pub market: BTreeMap<String, MarketSymbolConfig>,
}

impl EngineConfig {
    /// Load from an optional TOML file plus `QUASAR_` environment overrides
    ///
    /// Unknown keys anywhere in the tree fail the load.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("QUASAR")
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// Credentials and endpoint overrides read once from the environment
#[derive(Clone, Default)]
pub struct EnvOverrides {
    /// Market data source tag (`binance`, `sim`)
    pub market_source: Option<String>,
    /// Primary symbol override
    pub symbol: Option<String>,
    /// Execution mode (`paper`, `live`)
    pub exec_mode: Option<String>,
    /// API key, redacted in logs
    pub api_key: Option<String>,
    /// API secret, redacted in logs
    pub api_secret: Option<String>,
    /// WebSocket base URL override
    pub ws_base_url: Option<String>,
    /// REST base URL override
    pub rest_base_url: Option<String>,
    /// WAL sync mode override
    pub wal_sync_mode: Option<String>,
}

impl EnvOverrides {
    /// Snapshot the recognized environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            market_source: get("QUASAR_MARKET_SOURCE"),
            symbol: get("QUASAR_SYMBOL"),
            exec_mode: get("QUASAR_EXEC_MODE"),
            api_key: get("QUASAR_API_KEY"),
            api_secret: get("QUASAR_API_SECRET"),
            ws_base_url: get("QUASAR_WS_URL"),
            rest_base_url: get("QUASAR_REST_URL"),
            wal_sync_mode: get("QUASAR_WAL_SYNC"),
        }
    }
}

impl fmt::Debug for EnvOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("EnvOverrides")
            .field("market_source", &self.market_source)
            .field("symbol", &self.symbol)
            .field("exec_mode", &self.exec_mode)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .field("ws_base_url", &self.ws_base_url)
            .field("rest_base_url", &self.rest_base_url)
            .field("wal_sync_mode", &self.wal_sync_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.wal.enabled);
        assert_eq!(cfg.wal.flush_interval_ms, 5);
        assert_eq!(cfg.router.venue(Venue::Binance).rate_capacity, 10);
        assert_eq!(cfg.circuit.error_threshold, 5);
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            f,
            r#"
[wal]
enabled = false
dir = "/tmp/q"

[risk]
max_notional = 1000

[market.BTCUSDT]
venue = "binance"
kline_periods_ms = [60000]
"#
        )
        .unwrap();
        let cfg = EngineConfig::load(Some(f.path())).unwrap();
        assert!(!cfg.wal.enabled);
        assert_eq!(cfg.risk.max_notional, 1000);
        assert_eq!(cfg.market["BTCUSDT"].venue, "binance");
        assert_eq!(cfg.market["BTCUSDT"].stream_kinds, vec!["trade", "depth"]);
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(f, "[wal]\nenabled = true\nbogus_key = 1").unwrap();
        assert!(EngineConfig::load(Some(f.path())).is_err());
    }

    #[test]
    fn env_overrides_redact_secrets() {
        let env = EnvOverrides {
            api_key: Some("k".into()),
            api_secret: Some("s".into()),
            ..EnvOverrides::default()
        };
        let dbg = format!("{env:?}");
        assert!(!dbg.contains('k') || dbg.contains("<redacted>"));
        assert!(dbg.contains("<redacted>"));
    }
}
