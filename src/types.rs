// =============================================================================
// Shared types used across the consensus brain
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized vote direction carried by a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    /// Vocabulary we could not map. Kept for audit, never voted.
    Unknown,
}

impl Direction {
    /// Map free-form producer vocabulary onto a direction.
    ///
    /// Matching is a case-insensitive substring test: anything containing
    /// `BUY` or `BULLISH` is a buy, anything containing `SELL` or `BEARISH`
    /// is a sell. Buy vocabulary is checked first.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.to_uppercase();
        if upper.contains("BUY") || upper.contains("BULLISH") {
            Self::Buy
        } else if upper.contains("SELL") || upper.contains("BEARISH") {
            Self::Sell
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of a consensus evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Buy,
    Sell,
    Hold,
}

impl Outcome {
    /// The order side this outcome trades, if any.
    pub fn side(self) -> Option<TradeSide> {
        match self {
            Self::Buy => Some(TradeSide::Buy),
            Self::Sell => Some(TradeSide::Sell),
            Self::Hold => None,
        }
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Self::Hold
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Side of an order handed to the execution collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A normalized vote from one producer about one instrument.
///
/// Immutable once built by the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub producer_id: String,
    pub instrument: String,
    pub direction: Direction,
    /// Clamped to `[0, 1]`.
    pub confidence: f64,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        producer_id: impl Into<String>,
        instrument: impl Into<String>,
        direction: Direction,
        confidence: f64,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            instrument: instrument.into(),
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            received_at,
        }
    }

    /// Whether this signal takes part in voting.
    pub fn is_vote(&self) -> bool {
        self.direction != Direction::Unknown
    }
}

/// Verdict returned by a risk gate for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskApproval {
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub lot_size: f64,
}

impl RiskApproval {
    pub fn approve(lot_size: f64) -> Self {
        Self {
            allowed: true,
            reason: "approved".to_string(),
            lot_size,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            lot_size: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_maps_vocabulary() {
        assert_eq!(Direction::normalize("BUY"), Direction::Buy);
        assert_eq!(Direction::normalize("strong_buy"), Direction::Buy);
        assert_eq!(Direction::normalize("Bullish"), Direction::Buy);
        assert_eq!(Direction::normalize("SELL"), Direction::Sell);
        assert_eq!(Direction::normalize("bearish divergence"), Direction::Sell);
        assert_eq!(Direction::normalize("NEUTRAL"), Direction::Unknown);
        assert_eq!(Direction::normalize(""), Direction::Unknown);
    }

    #[test]
    fn signal_clamps_confidence() {
        let now = Utc::now();
        assert!((Signal::new("a", "EUR/USD", Direction::Buy, 1.7, now).confidence - 1.0).abs() < 1e-12);
        assert!(Signal::new("a", "EUR/USD", Direction::Buy, -0.3, now).confidence.abs() < 1e-12);
    }

    #[test]
    fn outcome_side() {
        assert_eq!(Outcome::Buy.side(), Some(TradeSide::Buy));
        assert_eq!(Outcome::Sell.side(), Some(TradeSide::Sell));
        assert_eq!(Outcome::Hold.side(), None);
        assert_eq!(Outcome::default(), Outcome::Hold);
    }

    #[test]
    fn outcome_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Outcome::Hold).unwrap(), "\"HOLD\"");
        assert_eq!(format!("{}", Outcome::Sell), "SELL");
    }
}
