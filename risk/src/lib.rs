//! Risk layer for the Quasar engine
//!
//! Pre-trade checks run on every order before it can reach the router;
//! the circuit breaker sits inside the router and fails fast when a
//! venue is misbehaving.

pub mod breaker;
pub mod rules;

pub use breaker::{Admission, BreakerRegistry, BreakerState, CircuitBreaker};
pub use rules::RiskEngine;
