//! Market quality anomaly detection
//!
//! Rolling-window statistics per symbol over the last N ticks (default
//! 100). Detection rules: price spikes beyond a sigma multiple, volume
//! surges above mean + sigma, spread widening beyond a median multiple,
//! and one-sided book imbalance. Detector output is advisory and lives
//! off the order path, so floating point is acceptable here.

use common::{BookTop, Px, Qty, Symbol, Ts};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Detector thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Rolling window length in ticks
    pub window: usize,
    /// Price spike threshold, standard deviations
    pub spike_sigma: f64,
    /// Volume surge threshold, standard deviations above the mean
    pub volume_sigma: f64,
    /// Spread widening threshold, multiple of the rolling median
    pub spread_factor: f64,
    /// Book imbalance threshold in [0, 1]
    pub imbalance_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window: 100,
            spike_sigma: 3.0,
            volume_sigma: 3.0,
            spread_factor: 5.0,
            imbalance_threshold: 0.8,
        }
    }
}

/// Anomaly classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// |Δprice| beyond sigma threshold
    PriceSpike,
    /// Volume above mean + sigma threshold
    VolumeSurge,
    /// Spread beyond factor × rolling median
    SpreadWidening,
    /// One-sided book beyond the imbalance threshold
    OrderImbalance,
}

/// One detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// Class of anomaly
    pub kind: AnomalyKind,
    /// Symbol it was observed on
    pub symbol: Symbol,
    /// How many thresholds the observation exceeded (sigma multiple or
    /// ratio, rule-dependent)
    pub severity: f64,
    /// Detection time
    pub ts: Ts,
}

#[derive(Debug, Default)]
struct SymbolWindow {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    spreads: VecDeque<f64>,
    last_price: Option<f64>,
}

impl SymbolWindow {
    fn push(dq: &mut VecDeque<f64>, cap: usize, v: f64) {
        if dq.len() == cap {
            dq.pop_front();
        }
        dq.push_back(v);
    }
}

fn mean_std(values: &VecDeque<f64>) -> (f64, f64) {
    let n = values.len() as f64;
    if n < 2.0 {
        return (values.iter().sum::<f64>() / n.max(1.0), 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

fn median(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite spreads"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Rolling-window anomaly detector over all symbols
#[derive(Debug)]
pub struct QualityDetector {
    config: QualityConfig,
    windows: FxHashMap<Symbol, SymbolWindow>,
}

impl QualityDetector {
    /// Create a detector with the given thresholds
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            windows: FxHashMap::default(),
        }
    }

    /// Minimum samples before a rule can fire
    const MIN_SAMPLES: usize = 20;

    /// Observe a trade; returns any anomalies it triggers
    pub fn on_trade(&mut self, symbol: Symbol, price: Px, qty: Qty, ts: Ts) -> Vec<Anomaly> {
        let window = self.windows.entry(symbol).or_default();
        let price_f = price.as_f64();
        let qty_f = qty.as_f64();
        let mut anomalies = Vec::new();

        if window.prices.len() >= Self::MIN_SAMPLES {
            if let Some(last) = window.last_price {
                let returns: VecDeque<f64> = window
                    .prices
                    .iter()
                    .zip(window.prices.iter().skip(1))
                    .map(|(a, b)| b - a)
                    .collect();
                let (_, std) = mean_std(&returns);
                let delta = (price_f - last).abs();
                if std > 0.0 && delta > self.config.spike_sigma * std {
                    anomalies.push(Anomaly {
                        kind: AnomalyKind::PriceSpike,
                        symbol,
                        severity: delta / std,
                        ts,
                    });
                }
            }

            let (mean, std) = mean_std(&window.volumes);
            if std > 0.0 && qty_f > mean + self.config.volume_sigma * std {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::VolumeSurge,
                    symbol,
                    severity: (qty_f - mean) / std,
                    ts,
                });
            }
        }

        SymbolWindow::push(&mut window.prices, self.config.window, price_f);
        SymbolWindow::push(&mut window.volumes, self.config.window, qty_f);
        window.last_price = Some(price_f);
        anomalies
    }

    /// Observe a top-of-book update; checks spread and imbalance rules
    pub fn on_top(&mut self, symbol: Symbol, top: &BookTop) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let window = self.windows.entry(symbol).or_default();

        if let Some(spread) = top.spread() {
            #[allow(clippy::cast_precision_loss)]
            let spread_f = spread as f64;
            if window.spreads.len() >= Self::MIN_SAMPLES {
                let med = median(&window.spreads);
                if med > 0.0 && spread_f > self.config.spread_factor * med {
                    anomalies.push(Anomaly {
                        kind: AnomalyKind::SpreadWidening,
                        symbol,
                        severity: spread_f / med,
                        ts: top.ts,
                    });
                }
            }
            SymbolWindow::push(&mut window.spreads, self.config.window, spread_f);
        }

        if let (Some((_, bid_qty)), Some((_, ask_qty))) = (top.bid, top.ask) {
            let bid = bid_qty.as_f64();
            let ask = ask_qty.as_f64();
            let total = bid + ask;
            if total > 0.0 {
                let imbalance = (bid - ask).abs() / total;
                if imbalance > self.config.imbalance_threshold {
                    anomalies.push(Anomaly {
                        kind: AnomalyKind::OrderImbalance,
                        symbol,
                        severity: imbalance,
                        ts: top.ts,
                    });
                }
            }
        }
        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(v: i64) -> Px {
        Px::parse(&v.to_string()).unwrap()
    }

    fn qty(v: i64) -> Qty {
        Qty::parse(&v.to_string()).unwrap()
    }

    fn feed_steady(det: &mut QualityDetector, symbol: Symbol, n: usize) {
        for i in 0..n {
            // Small alternating moves, steady volume.
            let p = if i % 2 == 0 { 100 } else { 101 };
            let anomalies = det.on_trade(symbol, px(p), qty(10), Ts::from_millis(i as u64));
            assert!(anomalies.is_empty(), "steady feed flagged: {anomalies:?}");
        }
    }

    #[test]
    fn price_spike_detected() {
        let mut det = QualityDetector::new(QualityConfig::default());
        let sym = Symbol::new(1);
        feed_steady(&mut det, sym, 50);

        let anomalies = det.on_trade(sym, px(150), qty(10), Ts::from_millis(1_000));
        assert!(
            anomalies
                .iter()
                .any(|a| a.kind == AnomalyKind::PriceSpike && a.severity > 3.0),
            "expected spike, got {anomalies:?}"
        );
    }

    #[test]
    fn volume_surge_detected() {
        let mut det = QualityDetector::new(QualityConfig::default());
        let sym = Symbol::new(1);
        for i in 0..50 {
            let q = 10 + (i % 3);
            det.on_trade(sym, px(100), qty(q), Ts::from_millis(i as u64));
        }
        let anomalies = det.on_trade(sym, px(100), qty(500), Ts::from_millis(1_000));
        assert!(
            anomalies.iter().any(|a| a.kind == AnomalyKind::VolumeSurge),
            "expected surge, got {anomalies:?}"
        );
    }

    #[test]
    fn spread_widening_detected() {
        let mut det = QualityDetector::new(QualityConfig::default());
        let sym = Symbol::new(1);
        let top = |bid: i64, ask: i64| BookTop {
            bid: Some((px(bid), qty(1))),
            ask: Some((px(ask), qty(1))),
            ts: Ts::from_millis(0),
        };
        for _ in 0..30 {
            assert!(det.on_top(sym, &top(100, 101)).is_empty());
        }
        let anomalies = det.on_top(sym, &top(100, 110));
        assert!(
            anomalies
                .iter()
                .any(|a| a.kind == AnomalyKind::SpreadWidening),
            "expected widening, got {anomalies:?}"
        );
    }

    #[test]
    fn imbalance_detected() {
        let mut det = QualityDetector::new(QualityConfig::default());
        let sym = Symbol::new(1);
        let top = BookTop {
            bid: Some((px(100), qty(95))),
            ask: Some((px(101), qty(1))),
            ts: Ts::from_millis(0),
        };
        let anomalies = det.on_top(sym, &top);
        assert!(
            anomalies
                .iter()
                .any(|a| a.kind == AnomalyKind::OrderImbalance && a.severity > 0.8)
        );

        // Balanced book stays quiet.
        let balanced = BookTop {
            bid: Some((px(100), qty(10))),
            ask: Some((px(101), qty(10))),
            ts: Ts::from_millis(0),
        };
        assert!(det.on_top(sym, &balanced).is_empty());
    }

    #[test]
    fn symbols_are_independent() {
        let mut det = QualityDetector::new(QualityConfig::default());
        feed_steady(&mut det, Symbol::new(1), 50);
        // Symbol 2 has no history; a large first trade is not a spike.
        let anomalies = det.on_trade(Symbol::new(2), px(999), qty(10), Ts::from_millis(0));
        assert!(anomalies.is_empty());
    }
}
