//! Built-in strategy templates
//!
//! Interchangeable, configuration-driven implementations of the common
//! templates. Each holds its parameters behind an `ArcSwap` so hot
//! reload swaps a complete snapshot atomically.

pub mod grid;
pub mod market_maker;
pub mod mean_reversion;
pub mod momentum;
pub mod ma_crossover;

use crate::Strategy;
use common::Symbol;
use common::config::StrategyConfig;

pub use grid::GridStrategy;
pub use ma_crossover::MaCrossover;
pub use market_maker::MarketMaker;
pub use mean_reversion::MeanReversion;
pub use momentum::Momentum;

/// Build a strategy instance from configuration
///
/// `symbol` is the interned id of the instrument named in the market
/// configuration for this strategy.
pub fn build(config: &StrategyConfig, symbol: Symbol) -> anyhow::Result<Box<dyn Strategy>> {
    let params = serde_json::Value::Object(
        config
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let strategy: Box<dyn Strategy> = match config.type_tag.as_str() {
        "ma_crossover" => Box::new(MaCrossover::new(&config.id, symbol, &params)?),
        "mean_reversion" => Box::new(MeanReversion::new(&config.id, symbol, &params)?),
        "momentum" => Box::new(Momentum::new(&config.id, symbol, &params)?),
        "market_maker" => Box::new(MarketMaker::new(&config.id, symbol, &params)?),
        "grid" => Box::new(GridStrategy::new(&config.id, symbol, &params)?),
        other => anyhow::bail!("unknown strategy type: {other}"),
    };
    Ok(strategy)
}
