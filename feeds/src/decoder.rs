//! Feed decoder contract
//!
//! A decoder turns venue wire frames into normalized [`MarketEvent`]s and
//! owns the venue-specific sequencing rules. The WebSocket client is
//! generic over this trait.

use common::{EngineError, MarketEvent, Symbol, Ts};

/// Output of decoding one wire frame
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// Normalized events, in arrival order
    pub events: Vec<MarketEvent>,
    /// Symbols that need a fresh REST snapshot
    pub need_snapshot: Vec<Symbol>,
    /// Frames or fields that failed to parse
    pub parse_errors: u64,
}

/// Venue-specific frame decoder driven by the WebSocket client
pub trait FeedDecoder: Send {
    /// Decode one text frame received at `ts_recv`
    fn decode(&mut self, text: &str, ts_recv: Ts) -> DecodeOutput;

    /// Full WebSocket URL including stream subscriptions
    fn stream_url(&self) -> String;

    /// REST snapshot URL for a symbol, when the venue requires
    /// snapshot+replay instead of resume
    fn snapshot_url(&self, symbol: Symbol) -> Option<String>;

    /// Fold a REST snapshot response; returns the snapshot event
    fn apply_snapshot(
        &mut self,
        symbol: Symbol,
        raw: &str,
        ts_recv: Ts,
    ) -> Result<MarketEvent, EngineError>;

    /// Reset sync state after a connection drop
    fn on_disconnect(&mut self);

    /// Symbols needing a snapshot to begin streaming (drained per call)
    fn initial_snapshots(&mut self) -> Vec<Symbol>;
}
