//! Market data pipeline for the Quasar engine
//!
//! WebSocket frames decode into normalized [`common::MarketEvent`]s and
//! fan out through the subscription registry to the order book, kline
//! aggregation, quality detection and strategies, all on the market
//! dispatcher.

pub mod binance;
pub mod decoder;
pub mod kline;
pub mod quality;
pub mod subscriptions;
pub mod ws;

pub use binance::{BinanceDecoder, BinanceEndpoints};
pub use decoder::{DecodeOutput, FeedDecoder};
pub use kline::{KlineAggregator, KlineService};
pub use quality::{Anomaly, AnomalyKind, QualityConfig, QualityDetector};
pub use subscriptions::{
    ConsumerCallback, SubscriptionId, SubscriptionManager, SubscriptionState,
};
pub use ws::{ConnState, FeedMessage, WsClient, WsClientConfig};
