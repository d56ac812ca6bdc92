// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Classifies the market into one of three regimes from auxiliary status
// messages (volatility state, session liquidity, news flag). The voting
// signals themselves never move the regime.
//
// Classification (first match wins):
//
//   1. DEFENSIVE          — news event flagged
//   2. MOMENTUM_BREAKOUT  — volatility BREAKOUT_WATCH, liquidity not LOW
//   3. MEAN_REVERSION     — volatility WAIT_CONSOLIDATION
//   4. DEFENSIVE          — anything else, including no data at all
//
// Status older than the staleness bound is ignored, so a silent volatility
// producer decays the engine back to DEFENSIVE.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

// =============================================================================
// Types
// =============================================================================

/// Coarse market regime used to reweight producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    /// No amplification. Initial state and the fallback.
    Defensive,
    /// High volatility breaking out — trend followers weigh more.
    MomentumBreakout,
    /// Quiet consolidation — mean-reversion producers weigh more.
    MeanReversion,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Defensive
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defensive => write!(f, "DEFENSIVE"),
            Self::MomentumBreakout => write!(f, "MOMENTUM_BREAKOUT"),
            Self::MeanReversion => write!(f, "MEAN_REVERSION"),
        }
    }
}

/// Volatility state reported by the volatility producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityState {
    BreakoutWatch,
    WaitConsolidation,
    Normal,
}

impl VolatilityState {
    fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.contains("BREAKOUT") || upper == "HIGH" {
            Some(Self::BreakoutWatch)
        } else if upper.contains("CONSOLIDATION") || upper == "LOW" {
            Some(Self::WaitConsolidation)
        } else if upper == "NORMAL" {
            Some(Self::Normal)
        } else {
            None
        }
    }
}

/// Session liquidity reported by the session producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Liquidity {
    High,
    Medium,
    Low,
}

impl Liquidity {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

/// One auxiliary status message. Absent fields leave the previous
/// observation in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub volatility: Option<VolatilityState>,
    pub atr: Option<f64>,
    pub liquidity: Option<Liquidity>,
    pub news_event: Option<bool>,
    pub received_at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Extract recognised fields from a status payload. `None` when the
    /// payload carries none of them.
    pub fn from_json(record: &Map<String, Value>, now: DateTime<Utc>) -> Option<Self> {
        let volatility = record
            .get("state")
            .or_else(|| record.get("volatility"))
            .and_then(Value::as_str)
            .and_then(VolatilityState::parse);
        let atr = record.get("atr").and_then(Value::as_f64);
        let liquidity = record
            .get("liquidity")
            .and_then(Value::as_str)
            .and_then(Liquidity::parse);
        let news_event = record.get("is_news_event").and_then(Value::as_bool);

        if volatility.is_none() && liquidity.is_none() && news_event.is_none() {
            return None;
        }

        Some(Self {
            volatility,
            atr,
            liquidity,
            news_event,
            received_at: now,
        })
    }
}

/// Latest auxiliary observations with their arrival times.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketConditions {
    pub volatility: Option<(VolatilityState, DateTime<Utc>)>,
    pub atr: Option<f64>,
    pub liquidity: Option<(Liquidity, DateTime<Utc>)>,
    pub news_event: Option<(bool, DateTime<Utc>)>,
}

// =============================================================================
// RegimeClassifier
// =============================================================================

struct Inner {
    conditions: MarketConditions,
    regime: Regime,
    since: DateTime<Utc>,
}

/// Holds the latest market conditions and the regime derived from them.
///
/// Written by the consumer loop only; read by every evaluation.
pub struct RegimeClassifier {
    state: RwLock<Inner>,
    stale_after: Duration,
}

impl RegimeClassifier {
    pub fn new(stale_secs: f64) -> Self {
        Self {
            state: RwLock::new(Inner {
                conditions: MarketConditions::default(),
                regime: Regime::Defensive,
                since: Utc::now(),
            }),
            stale_after: Duration::milliseconds((stale_secs.max(0.0) * 1_000.0).round() as i64),
        }
    }

    /// Merge a status update into the current conditions.
    pub fn observe(&self, update: &StatusUpdate) {
        let mut s = self.state.write();
        let at = update.received_at;
        if let Some(v) = update.volatility {
            s.conditions.volatility = Some((v, at));
        }
        if update.atr.is_some() {
            s.conditions.atr = update.atr;
        }
        if let Some(l) = update.liquidity {
            s.conditions.liquidity = Some((l, at));
        }
        if let Some(n) = update.news_event {
            s.conditions.news_event = Some((n, at));
        }
        debug!(
            volatility = ?update.volatility,
            liquidity = ?update.liquidity,
            news_event = ?update.news_event,
            "market status observed"
        );
    }

    /// Re-derive the regime from the current conditions as of `now`.
    pub fn classify(&self) -> Regime {
        self.classify_at(Utc::now())
    }

    pub fn classify_at(&self, now: DateTime<Utc>) -> Regime {
        let mut s = self.state.write();
        let fresh = |at: DateTime<Utc>| now - at < self.stale_after;

        let volatility = s.conditions.volatility.filter(|(_, at)| fresh(*at)).map(|(v, _)| v);
        let liquidity = s.conditions.liquidity.filter(|(_, at)| fresh(*at)).map(|(l, _)| l);
        let news = s
            .conditions
            .news_event
            .filter(|(_, at)| fresh(*at))
            .map(|(n, _)| n)
            .unwrap_or(false);

        let regime = classify(volatility, liquidity, news);
        if regime != s.regime {
            let held_secs = (now - s.since).num_milliseconds() as f64 / 1_000.0;
            info!(
                from = %s.regime,
                to = %regime,
                held_secs = format!("{:.1}", held_secs),
                "regime changed"
            );
            s.regime = regime;
            s.since = now;
        }
        regime
    }

    /// The regime from the last classification, without re-evaluating.
    pub fn current(&self) -> Regime {
        self.state.read().regime
    }

    pub fn conditions(&self) -> MarketConditions {
        self.state.read().conditions.clone()
    }
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(300.0)
    }
}

// =============================================================================
// Classification logic
// =============================================================================

fn classify(volatility: Option<VolatilityState>, liquidity: Option<Liquidity>, news: bool) -> Regime {
    if news {
        return Regime::Defensive;
    }
    match volatility {
        Some(VolatilityState::BreakoutWatch) if liquidity != Some(Liquidity::Low) => {
            Regime::MomentumBreakout
        }
        Some(VolatilityState::WaitConsolidation) => Regime::MeanReversion,
        _ => Regime::Defensive,
    }
}
