//! Strategy registry and lifecycle driver
//!
//! Owns every strategy instance, drives callbacks from the market
//! dispatcher and isolates failures: a strategy whose callback errors is
//! stopped and reported while the rest of the system continues.

use crate::{ExecutionUpdate, Signal, Strategy};
use common::{MarketEvent, Ts};
use tracing::{error, info, warn};

/// Snapshot of one strategy's runtime state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyStatus {
    /// Instance id
    pub id: String,
    /// Whether the strategy is receiving events
    pub is_running: bool,
    /// Terminal error, if the strategy was isolated
    pub error: Option<String>,
    /// Events delivered so far
    pub events_seen: u64,
    /// Signals pulled so far
    pub signals_emitted: u64,
}

struct Entry {
    strategy: Box<dyn Strategy>,
    is_running: bool,
    error: Option<String>,
    events_seen: u64,
    signals_emitted: u64,
}

/// A strategy failure surfaced to the engine
#[derive(Debug, Clone)]
pub struct StrategyFailure {
    /// Strategy that failed
    pub id: String,
    /// Error message
    pub error: String,
}

/// The runtime registry
#[derive(Default)]
pub struct StrategyRuntime {
    entries: Vec<Entry>,
}

impl StrategyRuntime {
    /// Create an empty runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy; it stays idle until [`Self::start_all`]
    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        info!(strategy = strategy.id(), "strategy registered");
        self.entries.push(Entry {
            strategy,
            is_running: false,
            error: None,
            events_seen: 0,
            signals_emitted: 0,
        });
    }

    /// Start every registered strategy
    pub fn start_all(&mut self) -> Vec<StrategyFailure> {
        let mut failures = Vec::new();
        for entry in &mut self.entries {
            match entry.strategy.on_start() {
                Ok(()) => entry.is_running = true,
                Err(e) => {
                    error!(strategy = entry.strategy.id(), error = %e, "strategy failed to start");
                    entry.error = Some(e.to_string());
                    failures.push(StrategyFailure {
                        id: entry.strategy.id().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Stop one strategy by id
    pub fn stop(&mut self, id: &str) -> bool {
        for entry in &mut self.entries {
            if entry.strategy.id() == id && entry.is_running {
                entry.strategy.on_stop();
                entry.is_running = false;
                info!(strategy = id, "strategy stopped");
                return true;
            }
        }
        false
    }

    /// Stop everything (shutdown path)
    pub fn stop_all(&mut self) {
        for entry in &mut self.entries {
            if entry.is_running {
                entry.strategy.on_stop();
                entry.is_running = false;
            }
        }
    }

    /// Deliver a market event to one strategy by id
    ///
    /// Used when delivery is routed through the subscription manager.
    pub fn deliver(&mut self, id: &str, event: &MarketEvent) -> Option<StrategyFailure> {
        for entry in &mut self.entries {
            if entry.strategy.id() != id || !entry.is_running {
                continue;
            }
            entry.events_seen += 1;
            if let Err(e) = entry.strategy.on_market_event(event) {
                return Some(Self::isolate(entry, &e));
            }
            return None;
        }
        None
    }

    /// Deliver a market event to every running strategy
    pub fn on_market_event(&mut self, event: &MarketEvent) -> Vec<StrategyFailure> {
        let mut failures = Vec::new();
        for entry in &mut self.entries {
            if !entry.is_running {
                continue;
            }
            entry.events_seen += 1;
            if let Err(e) = entry.strategy.on_market_event(event) {
                failures.push(Self::isolate(entry, &e));
            }
        }
        failures
    }

    /// Deliver a timer tick to every running strategy
    pub fn on_timer(&mut self, now: Ts) -> Vec<StrategyFailure> {
        let mut failures = Vec::new();
        for entry in &mut self.entries {
            if !entry.is_running {
                continue;
            }
            if let Err(e) = entry.strategy.on_timer(now) {
                failures.push(Self::isolate(entry, &e));
            }
        }
        failures
    }

    /// Deliver execution feedback to every running strategy
    pub fn on_execution_update(&mut self, update: &ExecutionUpdate) {
        for entry in &mut self.entries {
            if entry.is_running {
                entry.strategy.on_position_update(update);
            }
        }
    }

    /// Pull pending signals from every running strategy
    pub fn collect_signals(&mut self) -> Vec<(String, Signal)> {
        let mut out = Vec::new();
        for entry in &mut self.entries {
            if !entry.is_running {
                continue;
            }
            for signal in entry.strategy.get_signals() {
                entry.signals_emitted += 1;
                out.push((entry.strategy.id().to_string(), signal));
            }
        }
        out
    }

    /// Atomically swap a strategy's parameters
    pub fn update_params(&mut self, id: &str, params: &serde_json::Value) -> anyhow::Result<()> {
        for entry in &mut self.entries {
            if entry.strategy.id() == id {
                entry.strategy.update_params(params)?;
                info!(strategy = id, "parameters hot-swapped");
                return Ok(());
            }
        }
        anyhow::bail!("unknown strategy: {id}")
    }

    /// Status snapshot for every strategy
    #[must_use]
    pub fn statuses(&self) -> Vec<StrategyStatus> {
        self.entries
            .iter()
            .map(|e| StrategyStatus {
                id: e.strategy.id().to_string(),
                is_running: e.is_running,
                error: e.error.clone(),
                events_seen: e.events_seen,
                signals_emitted: e.signals_emitted,
            })
            .collect()
    }

    fn isolate(entry: &mut Entry, e: &anyhow::Error) -> StrategyFailure {
        warn!(strategy = entry.strategy.id(), error = %e, "isolating failed strategy");
        entry.strategy.on_stop();
        entry.is_running = false;
        entry.error = Some(e.to_string());
        StrategyFailure {
            id: entry.strategy.id().to_string(),
            error: e.to_string(),
        }
    }
}
