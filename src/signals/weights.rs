// =============================================================================
// Producer Weights — base weights and regime multipliers
// =============================================================================
//
// `WeightTable` is an immutable value handed to each evaluation. Updates go
// through `WeightStore`, which swaps in a fresh copy so concurrent readers
// keep the table they started with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::regime::Regime;

/// Weight of any producer missing from the table.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// How a producer trades, which decides its regime multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProducerStyle {
    TrendFollowing,
    MeanReversion,
    Neutral,
}

impl Default for ProducerStyle {
    fn default() -> Self {
        Self::Neutral
    }
}

// =============================================================================
// WeightTable
// =============================================================================

/// producer_id -> base weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    weights: HashMap<String, f64>,
}

impl WeightTable {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Base weight for `producer_id`, [`DEFAULT_WEIGHT`] when unknown.
    pub fn weight(&self, producer_id: &str) -> f64 {
        self.weights
            .get(producer_id)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Copy of this table with one weight changed.
    pub fn with_weight(&self, producer_id: impl Into<String>, weight: f64) -> Self {
        let mut weights = self.weights.clone();
        weights.insert(producer_id.into(), weight.max(0.0));
        Self { weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Single-writer, copy-on-write holder of the current [`WeightTable`].
#[derive(Debug, Default)]
pub struct WeightStore {
    current: RwLock<Arc<WeightTable>>,
}

impl WeightStore {
    pub fn new(table: WeightTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// The table in effect right now. Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<WeightTable> {
        self.current.read().clone()
    }

    /// Set one producer's base weight.
    pub fn update(&self, producer_id: &str, weight: f64) {
        let next = Arc::new(self.current().with_weight(producer_id, weight));
        *self.current.write() = next;
        info!(producer = producer_id, weight, "producer weight updated");
    }

    /// Replace the whole table.
    pub fn replace(&self, table: WeightTable) {
        let producers = table.len();
        *self.current.write() = Arc::new(table);
        info!(producers, "producer weight table replaced");
    }
}

// =============================================================================
// RegimeMultipliers
// =============================================================================

/// Regime-dependent weight multipliers keyed by producer style.
#[derive(Debug, Clone, Default)]
pub struct RegimeMultipliers {
    styles: HashMap<String, ProducerStyle>,
    table: HashMap<Regime, HashMap<ProducerStyle, f64>>,
}

impl RegimeMultipliers {
    pub fn new(
        styles: HashMap<String, ProducerStyle>,
        table: HashMap<Regime, HashMap<ProducerStyle, f64>>,
    ) -> Self {
        Self { styles, table }
    }

    pub fn style(&self, producer_id: &str) -> ProducerStyle {
        self.styles.get(producer_id).copied().unwrap_or_default()
    }

    /// Multiplier applied to `producer_id` under `regime`; 1.0 when unset.
    pub fn multiplier(&self, producer_id: &str, regime: Regime) -> f64 {
        let style = self.style(producer_id);
        self.table
            .get(&regime)
            .and_then(|by_style| by_style.get(&style))
            .copied()
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipliers() -> RegimeMultipliers {
        RegimeMultipliers::new(
            HashMap::from([
                ("trend".to_string(), ProducerStyle::TrendFollowing),
                ("revert".to_string(), ProducerStyle::MeanReversion),
            ]),
            HashMap::from([
                (
                    Regime::MomentumBreakout,
                    HashMap::from([(ProducerStyle::TrendFollowing, 2.0)]),
                ),
                (
                    Regime::MeanReversion,
                    HashMap::from([(ProducerStyle::MeanReversion, 2.0)]),
                ),
            ]),
        )
    }

    #[test]
    fn unknown_producer_weighs_one() {
        let table = WeightTable::new(HashMap::from([("news".to_string(), 0.4)]));
        assert!((table.weight("news") - 0.4).abs() < 1e-12);
        assert!((table.weight("anyone") - DEFAULT_WEIGHT).abs() < 1e-12);
    }

    #[test]
    fn multiplier_follows_regime_and_style() {
        let m = multipliers();
        assert!((m.multiplier("trend", Regime::MomentumBreakout) - 2.0).abs() < 1e-12);
        assert!((m.multiplier("trend", Regime::Defensive) - 1.0).abs() < 1e-12);
        assert!((m.multiplier("trend", Regime::MeanReversion) - 1.0).abs() < 1e-12);
        assert!((m.multiplier("revert", Regime::MeanReversion) - 2.0).abs() < 1e-12);
        assert!((m.multiplier("other", Regime::MomentumBreakout) - 1.0).abs() < 1e-12);
        assert_eq!(m.style("other"), ProducerStyle::Neutral);
    }

    #[test]
    fn store_update_is_copy_on_write() {
        let store = WeightStore::new(WeightTable::default());
        let before = store.current();
        store.update("technical_agent", 1.5);
        let after = store.current();

        assert!((before.weight("technical_agent") - 1.0).abs() < 1e-12);
        assert!((after.weight("technical_agent") - 1.5).abs() < 1e-12);

        store.replace(WeightTable::new(HashMap::from([("news_agent".to_string(), 0.3)])));
        let replaced = store.current();
        assert!((replaced.weight("news_agent") - 0.3).abs() < 1e-12);
        assert!((replaced.weight("technical_agent") - DEFAULT_WEIGHT).abs() < 1e-12);
        // Readers holding the old table keep it.
        assert!((after.weight("technical_agent") - 1.5).abs() < 1e-12);
    }

    #[test]
    fn negative_weight_is_floored() {
        let table = WeightTable::default().with_weight("x", -2.0);
        assert!(table.weight("x").abs() < 1e-12);
    }
}
