//! Engine-wide error taxonomy
//!
//! Every kind carries a stable string code (surfaced in `error` events and
//! logs) plus a human-readable message. Propagation policy lives with the
//! subsystems; this module only defines the vocabulary.

use thiserror::Error;

/// The engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input (stdio command, wire frame, config literal)
    #[error("parse error: {0}")]
    Parse(String),

    /// Local I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network-level failure talking to an exchange
    #[error("network error: {0}")]
    Network(String),

    /// A deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Credentials rejected; fatal for the venue
    #[error("auth error: {0}")]
    Auth(String),

    /// Throttled by the venue
    #[error("rate limited; retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait before retrying
        retry_after_ms: u64,
    },

    /// The exchange rejected the request outright
    #[error("exchange reject {code}: {msg}")]
    ExchangeReject {
        /// Venue-specific reject code
        code: String,
        /// Venue-supplied message
        msg: String,
    },

    /// Market feed sequence gap detected
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// Next sequence the book would have accepted
        expected: u64,
        /// Sequence actually received
        got: u64,
    },

    /// A pre-trade risk rule failed
    #[error("risk rejected by {rule}: observed {observed}, limit {limit}")]
    RiskRejected {
        /// Rule that fired
        rule: String,
        /// Observed value, fixed-point ticks
        observed: i64,
        /// Configured limit, fixed-point ticks
        limit: i64,
    },

    /// The circuit breaker is open for the venue
    #[error("circuit open for {venue}")]
    CircuitOpen {
        /// Venue whose breaker is open
        venue: String,
    },

    /// A client order id collided with an in-flight order
    #[error("client order id collision: {0}")]
    IdCollision(String),

    /// The write-ahead log failed; order acceptance stops
    #[error("wal write error: {0}")]
    WalWrite(String),

    /// An event referenced an order the engine does not know
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// Invariant violation; fatal for the owning dispatcher
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable string code for event emission
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Io(_) => "io",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::ExchangeReject { .. } => "exchange_reject",
            Self::SequenceGap { .. } => "sequence_gap",
            Self::RiskRejected { .. } => "risk_rejected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::IdCollision(_) => "id_collision",
            Self::WalWrite(_) => "wal_write",
            Self::UnknownOrder(_) => "unknown_order",
            Self::Internal(_) => "internal",
        }
    }

    /// True when the order path may retry the operation
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Parse("x".into()).code(), "parse");
        assert_eq!(
            EngineError::RiskRejected {
                rule: "max_notional".into(),
                observed: 2,
                limit: 1
            }
            .code(),
            "risk_rejected"
        );
        assert_eq!(
            EngineError::CircuitOpen {
                venue: "binance".into()
            }
            .code(),
            "circuit_open"
        );
    }

    #[test]
    fn retryability_follows_policy() {
        assert!(EngineError::Network("reset".into()).is_retryable());
        assert!(EngineError::Timeout("deadline".into()).is_retryable());
        assert!(EngineError::RateLimited { retry_after_ms: 5 }.is_retryable());
        assert!(!EngineError::Auth("bad key".into()).is_retryable());
        assert!(
            !EngineError::ExchangeReject {
                code: "-2010".into(),
                msg: "insufficient balance".into()
            }
            .is_retryable()
        );
    }
}
