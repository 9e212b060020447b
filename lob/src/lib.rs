//! Limit order book for the Quasar engine
//!
//! Sequence-validated bid/ask ladders. Updates apply in strict feed
//! order; gaps invalidate the book and buffer deltas for snapshot
//! replay. Best bid/ask, mid, spread and imbalance are read out by the
//! market dispatcher and copied to other threads as [`common::BookTop`].

pub mod book;

pub use book::{ApplyOutcome, BookError, OrderBook};
