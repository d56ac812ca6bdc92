// =============================================================================
// Consensus Engine — Regime-aware weighted voting
// =============================================================================
//
// For each voting signal in the window:
//
//   effective_weight = base_weight(producer) * multiplier(producer, regime)
//   score            = confidence * effective_weight
//
// Scores accumulate into buy or sell power; every effective weight goes into
// total_weight. A side wins only when its power strictly exceeds
// total_weight * threshold. With a threshold above 0.5 both sides can never
// qualify together; below 0.5 a double qualification resolves to HOLD.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::regime::Regime;
use crate::signals::{RegimeMultipliers, SignalWindow, WeightTable};
use crate::types::{Direction, Outcome, Signal};

/// The contribution of a single signal to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteContribution {
    pub producer_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub base_weight: f64,
    pub multiplier: f64,
    pub effective_weight: f64,
    pub score: f64,
}

/// Result of one evaluation. Built fresh each time, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub instrument: String,
    pub buy_power: f64,
    pub sell_power: f64,
    pub total_weight: f64,
    pub outcome: Outcome,
    /// Winning side's share of total weight, 0..100.
    pub confidence_pct: f64,
    pub regime: Regime,
    pub evaluated_at: DateTime<Utc>,
    /// Signals in the window that did not vote.
    pub abstentions: usize,
    pub contributions: Vec<VoteContribution>,
}

impl Decision {
    pub fn is_actionable(&self) -> bool {
        self.outcome != Outcome::Hold
    }
}

pub struct ConsensusEngine {
    window: Arc<SignalWindow>,
    multipliers: RegimeMultipliers,
    /// Fraction of total weight one side must exceed.
    pub threshold: f64,
}

impl ConsensusEngine {
    pub fn new(window: Arc<SignalWindow>, multipliers: RegimeMultipliers, threshold: f64) -> Self {
        Self {
            window,
            multipliers,
            threshold,
        }
    }

    pub fn window(&self) -> &Arc<SignalWindow> {
        &self.window
    }

    /// Evaluate `instrument` from its current window.
    pub fn evaluate(&self, instrument: &str, weights: &WeightTable, regime: Regime) -> Decision {
        self.evaluate_at(instrument, weights, regime, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        instrument: &str,
        weights: &WeightTable,
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Decision {
        let snapshot = self.window.snapshot_at(instrument, now);
        self.score(instrument, &snapshot, weights, regime, now)
    }

    /// Score an explicit set of signals.
    pub fn score(
        &self,
        instrument: &str,
        signals: &[Signal],
        weights: &WeightTable,
        regime: Regime,
        now: DateTime<Utc>,
    ) -> Decision {
        let mut contributions = Vec::with_capacity(signals.len());
        let mut buy_power = 0.0;
        let mut sell_power = 0.0;
        let mut total_weight = 0.0;
        let mut abstentions = 0;

        for signal in signals {
            if !signal.is_vote() {
                abstentions += 1;
                continue;
            }

            let base_weight = weights.weight(&signal.producer_id);
            let multiplier = self.multipliers.multiplier(&signal.producer_id, regime);
            let effective_weight = base_weight * multiplier;
            let score = signal.confidence * effective_weight;

            match signal.direction {
                Direction::Buy => buy_power += score,
                Direction::Sell => sell_power += score,
                Direction::Unknown => {}
            }
            total_weight += effective_weight;

            contributions.push(VoteContribution {
                producer_id: signal.producer_id.clone(),
                direction: signal.direction,
                confidence: signal.confidence,
                base_weight,
                multiplier,
                effective_weight,
                score,
            });
        }

        let required_power = total_weight * self.threshold;
        let buy_wins = total_weight > 0.0 && buy_power > required_power;
        let sell_wins = total_weight > 0.0 && sell_power > required_power;

        let outcome = match (buy_wins, sell_wins) {
            (true, false) => Outcome::Buy,
            (false, true) => Outcome::Sell,
            (true, true) => {
                warn!(
                    instrument,
                    buy_power,
                    sell_power,
                    threshold = self.threshold,
                    "both sides cleared the threshold; holding"
                );
                Outcome::Hold
            }
            (false, false) => Outcome::Hold,
        };

        let confidence_pct = if total_weight > 0.0 {
            buy_power.max(sell_power) / total_weight * 100.0
        } else {
            0.0
        };

        debug!(
            instrument,
            regime = %regime,
            buy_power = format!("{:.3}", buy_power),
            sell_power = format!("{:.3}", sell_power),
            total_weight = format!("{:.3}", total_weight),
            required = format!("{:.3}", required_power),
            outcome = %outcome,
            "consensus evaluated"
        );

        Decision {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            buy_power,
            sell_power,
            total_weight,
            outcome,
            confidence_pct,
            regime,
            evaluated_at: now,
            abstentions,
            contributions,
        }
    }
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::ProducerStyle;
    use std::collections::HashMap;

    fn engine(threshold: f64) -> ConsensusEngine {
        let multipliers = RegimeMultipliers::new(
            HashMap::from([
                ("technical_agent".to_string(), ProducerStyle::TrendFollowing),
                ("orderbook_agent".to_string(), ProducerStyle::MeanReversion),
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
        );
        ConsensusEngine::new(Arc::new(SignalWindow::new(10.0)), multipliers, threshold)
    }

    fn vote(producer: &str, direction: Direction, confidence: f64) -> Signal {
        Signal::new(producer, "EUR/USD", direction, confidence, Utc::now())
    }

    #[test]
    fn split_vote_holds() {
        let e = engine(0.75);
        let signals = vec![
            vote("a", Direction::Buy, 0.9),
            vote("b", Direction::Sell, 0.9),
        ];
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::Defensive, Utc::now());
        assert!((d.total_weight - 2.0).abs() < 1e-9);
        assert!((d.buy_power - 0.9).abs() < 1e-9);
        assert!((d.sell_power - 0.9).abs() < 1e-9);
        assert_eq!(d.outcome, Outcome::Hold);
        assert!((d.confidence_pct - 45.0).abs() < 1e-9);
    }

    #[test]
    fn qualifying_majority_buys() {
        let e = engine(0.75);
        let signals = vec![
            vote("a", Direction::Buy, 0.9),
            vote("b", Direction::Buy, 0.9),
            vote("c", Direction::Buy, 0.9),
        ];
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::Defensive, Utc::now());
        assert!((d.total_weight - 3.0).abs() < 1e-9);
        assert!((d.buy_power - 2.7).abs() < 1e-9);
        assert_eq!(d.outcome, Outcome::Buy);
        assert!((d.confidence_pct - 90.0).abs() < 1e-9);
        assert!(d.is_actionable());
    }

    #[test]
    fn sell_majority_sells() {
        let e = engine(0.75);
        let signals = vec![
            vote("a", Direction::Sell, 0.95),
            vote("b", Direction::Sell, 0.85),
        ];
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::Defensive, Utc::now());
        assert_eq!(d.outcome, Outcome::Sell);
    }

    #[test]
    fn empty_window_holds_without_dividing() {
        let e = engine(0.75);
        let d = e.evaluate("EUR/USD", &WeightTable::default(), Regime::Defensive);
        assert_eq!(d.outcome, Outcome::Hold);
        assert!(d.total_weight.abs() < 1e-12);
        assert!(d.confidence_pct.abs() < 1e-12);
    }

    #[test]
    fn unknown_votes_abstain() {
        let e = engine(0.75);
        let signals = vec![
            vote("a", Direction::Buy, 0.9),
            vote("b", Direction::Unknown, 0.9),
            vote("c", Direction::Unknown, 0.9),
        ];
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::Defensive, Utc::now());
        assert!((d.total_weight - 1.0).abs() < 1e-9);
        assert_eq!(d.abstentions, 2);
        assert_eq!(d.contributions.len(), 1);
        assert_eq!(d.outcome, Outcome::Buy);
    }

    #[test]
    fn zero_weight_producers_hold() {
        let e = engine(0.75);
        let weights = WeightTable::default().with_weight("a", 0.0);
        let d = e.score("EUR/USD", &[vote("a", Direction::Buy, 1.0)], &weights, Regime::Defensive, Utc::now());
        assert_eq!(d.outcome, Outcome::Hold);
        assert!(d.confidence_pct.abs() < 1e-12);
    }

    #[test]
    fn momentum_regime_doubles_trend_follower() {
        let e = engine(0.75);
        let signals = vec![
            vote("technical_agent", Direction::Buy, 0.95),
            vote("news_agent", Direction::Buy, 0.5),
        ];
        let weights = WeightTable::default();

        // total 2.0, required 1.5, buy 1.45
        let defensive = e.score("EUR/USD", &signals, &weights, Regime::Defensive, Utc::now());
        assert!((defensive.contributions[0].effective_weight - 1.0).abs() < 1e-9);
        assert_eq!(defensive.outcome, Outcome::Hold);

        // total 3.0, required 2.25, buy 2.4
        let momentum = e.score("EUR/USD", &signals, &weights, Regime::MomentumBreakout, Utc::now());
        assert!((momentum.contributions[0].effective_weight - 2.0).abs() < 1e-9);
        assert!((momentum.total_weight - 3.0).abs() < 1e-9);
        assert!((momentum.buy_power - 2.4).abs() < 1e-9);
        assert_eq!(momentum.outcome, Outcome::Buy);
    }

    #[test]
    fn mean_reversion_regime_doubles_reverter_only() {
        let e = engine(0.75);
        let signals = vec![
            vote("orderbook_agent", Direction::Sell, 0.9),
            vote("technical_agent", Direction::Sell, 0.9),
        ];
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::MeanReversion, Utc::now());
        assert!((d.total_weight - 3.0).abs() < 1e-9);
        assert!((d.sell_power - 2.7).abs() < 1e-9);
        assert_eq!(d.outcome, Outcome::Sell);
    }

    #[test]
    fn low_threshold_tie_holds() {
        let e = engine(0.4);
        let signals = vec![
            vote("a", Direction::Buy, 0.9),
            vote("b", Direction::Sell, 0.9),
        ];
        // total 2.0, required 0.8, both sides 0.9
        let d = e.score("EUR/USD", &signals, &WeightTable::default(), Regime::Defensive, Utc::now());
        assert_eq!(d.outcome, Outcome::Hold);
    }

    #[test]
    fn evaluate_reads_the_window() {
        let e = engine(0.75);
        let now = Utc::now();
        for p in ["a", "b", "c"] {
            e.window()
                .append_at("EUR/USD", Signal::new(p, "EUR/USD", Direction::Buy, 0.9, now), now);
        }
        let d = e.evaluate_at("EUR/USD", &WeightTable::default(), Regime::Defensive, now);
        assert_eq!(d.outcome, Outcome::Buy);
        assert_eq!(d.instrument, "EUR/USD");
    }
}
