// =============================================================================
// Runtime Configuration — Externally supplied engine settings with atomic save
// =============================================================================
//
// Every tunable of the consensus pipeline lives here: window length, the
// consensus threshold, producer weights, regime multipliers, the reference
// risk gate parameters and bus topics. Nothing in the algorithm hard-codes
// these values.
//
// All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Persistence uses tmp + rename.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::regime::Regime;
use crate::signals::ProducerStyle;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_window_seconds() -> f64 {
    10.0
}

fn default_consensus_threshold() -> f64 {
    0.75
}

fn default_confidence() -> f64 {
    0.5
}

fn default_producer_styles() -> HashMap<String, ProducerStyle> {
    let mut styles = HashMap::new();
    styles.insert("technical_agent".to_string(), ProducerStyle::TrendFollowing);
    styles.insert("vision_agent".to_string(), ProducerStyle::TrendFollowing);
    styles.insert("orderbook_agent".to_string(), ProducerStyle::MeanReversion);
    styles.insert("correlation_agent".to_string(), ProducerStyle::MeanReversion);
    styles
}

fn default_regime_multipliers() -> HashMap<Regime, HashMap<ProducerStyle, f64>> {
    let mut table = HashMap::new();
    table.insert(
        Regime::MomentumBreakout,
        HashMap::from([(ProducerStyle::TrendFollowing, 2.0)]),
    );
    table.insert(
        Regime::MeanReversion,
        HashMap::from([(ProducerStyle::MeanReversion, 2.0)]),
    );
    table
}

fn default_regime_stale_secs() -> f64 {
    300.0
}

fn default_risk_timeout_ms() -> u64 {
    2_000
}

fn default_execution_timeout_secs() -> f64 {
    30.0
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_signal_pattern() -> String {
    "signals:*".to_string()
}

fn default_status_topics() -> Vec<String> {
    vec!["market_status".to_string(), "signals:volatility".to_string()]
}

fn default_audit_topic() -> String {
    "brain_status".to_string()
}

fn default_account_balance() -> f64 {
    10_000.0
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_stop_loss_pips() -> f64 {
    20.0
}

fn default_pip_value() -> f64 {
    10.0
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_max_lot() -> f64 {
    100.0
}

fn default_max_daily_trades() -> u32 {
    50
}

fn default_max_consecutive_losses() -> u32 {
    5
}

// =============================================================================
// RiskParams
// =============================================================================

/// Parameters of the reference risk gate (lot sizing and circuit breakers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Account balance used for risk-amount computation.
    #[serde(default = "default_account_balance")]
    pub account_balance: f64,

    /// Fraction of the balance risked per trade (0.01 = 1 %).
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Stop distance in pips used for sizing.
    #[serde(default = "default_stop_loss_pips")]
    pub stop_loss_pips: f64,

    /// Account currency value of one pip for one standard lot.
    #[serde(default = "default_pip_value")]
    pub pip_value: f64,

    /// Platform minimum lot. Also returned when the stop distance is unusable.
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,

    /// Lot increment sizes are rounded to.
    #[serde(default = "default_min_lot")]
    pub lot_step: f64,

    #[serde(default = "default_max_lot")]
    pub max_lot: f64,

    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            account_balance: default_account_balance(),
            risk_per_trade: default_risk_per_trade(),
            stop_loss_pips: default_stop_loss_pips(),
            pip_value: default_pip_value(),
            min_lot: default_min_lot(),
            lot_step: default_min_lot(),
            max_lot: default_max_lot(),
            max_daily_trades: default_max_daily_trades(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

// =============================================================================
// BusSettings
// =============================================================================

/// Topics and connection details for the signal bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Pattern the engine subscribes to for producer signals.
    #[serde(default = "default_signal_pattern")]
    pub signal_pattern: String,

    /// Auxiliary status topics feeding the regime classifier.
    #[serde(default = "default_status_topics")]
    pub status_topics: Vec<String>,

    /// Observability topic every decision is published to.
    #[serde(default = "default_audit_topic")]
    pub audit_topic: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            signal_pattern: default_signal_pattern(),
            status_topics: default_status_topics(),
            audit_topic: default_audit_topic(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the consensus brain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Signal window ------------------------------------------------------

    /// Signals aged this many seconds or more are evicted.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,

    // --- Consensus ----------------------------------------------------------

    /// Fraction of total active weight one side must exceed.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    /// Confidence assumed for signals that omit one.
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,

    /// Base weight per producer. Producers not listed weigh 1.0.
    #[serde(default)]
    pub producer_weights: HashMap<String, f64>,

    /// Trading style per producer, used to pick a regime multiplier.
    #[serde(default = "default_producer_styles")]
    pub producer_styles: HashMap<String, ProducerStyle>,

    /// Regime -> style -> multiplier. Missing entries multiply by 1.0.
    #[serde(default = "default_regime_multipliers")]
    pub regime_multipliers: HashMap<Regime, HashMap<ProducerStyle, f64>>,

    // --- Regime -------------------------------------------------------------

    /// Auxiliary status older than this is ignored.
    #[serde(default = "default_regime_stale_secs")]
    pub regime_stale_secs: f64,

    // --- Collaborator timeouts ----------------------------------------------

    #[serde(default = "default_risk_timeout_ms")]
    pub risk_timeout_ms: u64,

    /// Upper bound on one order submission before its lock is released.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: f64,

    // --- Collaborators ------------------------------------------------------

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub risk: RiskParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            consensus_threshold: default_consensus_threshold(),
            default_confidence: default_confidence(),
            producer_weights: HashMap::new(),
            producer_styles: default_producer_styles(),
            regime_multipliers: default_regime_multipliers(),
            regime_stale_secs: default_regime_stale_secs(),
            risk_timeout_ms: default_risk_timeout_ms(),
            execution_timeout_secs: default_execution_timeout_secs(),
            bus: BusSettings::default(),
            risk: RiskParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            window_seconds = config.window_seconds,
            consensus_threshold = config.consensus_threshold,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `BRAIN_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BRAIN_REDIS_URL") {
            self.bus.redis_url = url;
        }
        if let Ok(raw) = std::env::var("BRAIN_WINDOW_SECONDS") {
            match raw.parse() {
                Ok(v) => self.window_seconds = v,
                Err(_) => warn!(value = %raw, "ignoring unparsable BRAIN_WINDOW_SECONDS"),
            }
        }
        if let Ok(raw) = std::env::var("BRAIN_CONSENSUS_THRESHOLD") {
            match raw.parse() {
                Ok(v) => self.consensus_threshold = v,
                Err(_) => warn!(value = %raw, "ignoring unparsable BRAIN_CONSENSUS_THRESHOLD"),
            }
        }
    }

    /// Reject values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !(self.window_seconds.is_finite() && self.window_seconds > 0.0) {
            bail!("window_seconds must be positive, got {}", self.window_seconds);
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            bail!(
                "consensus_threshold must be in (0, 1], got {}",
                self.consensus_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.default_confidence) {
            bail!(
                "default_confidence must be in [0, 1], got {}",
                self.default_confidence
            );
        }
        if let Some((producer, weight)) = self
            .producer_weights
            .iter()
            .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
        {
            bail!("weight for producer {producer} must be non-negative, got {weight}");
        }
        for (regime, by_style) in &self.regime_multipliers {
            if let Some((style, m)) = by_style.iter().find(|(_, m)| !(m.is_finite() && **m >= 0.0)) {
                bail!("multiplier for {style:?} under {regime} must be non-negative, got {m}");
            }
        }
        if !(self.execution_timeout_secs.is_finite() && self.execution_timeout_secs > 0.0) {
            bail!(
                "execution_timeout_secs must be positive, got {}",
                self.execution_timeout_secs
            );
        }
        if self.consensus_threshold < 0.5 {
            warn!(
                threshold = self.consensus_threshold,
                "consensus threshold below 0.5: ties between BUY and SELL resolve to HOLD"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!((cfg.window_seconds - 10.0).abs() < f64::EPSILON);
        assert!((cfg.consensus_threshold - 0.75).abs() < f64::EPSILON);
        assert!((cfg.default_confidence - 0.5).abs() < f64::EPSILON);
        assert!(cfg.producer_weights.is_empty());
        assert_eq!(cfg.bus.signal_pattern, "signals:*");
        assert_eq!(cfg.bus.audit_topic, "brain_status");
        assert_eq!(
            cfg.producer_styles.get("technical_agent"),
            Some(&ProducerStyle::TrendFollowing)
        );
        let momentum = &cfg.regime_multipliers[&Regime::MomentumBreakout];
        assert!((momentum[&ProducerStyle::TrendFollowing] - 2.0).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!((cfg.window_seconds - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_daily_trades, 50);
        assert!((cfg.risk.min_lot - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.bus.status_topics, vec!["market_status", "signals:volatility"]);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "consensus_threshold": 0.6,
            "producer_weights": { "news_agent": 0.5 },
            "regime_multipliers": { "MEAN_REVERSION": { "MEAN_REVERSION": 3.0 } },
            "risk": { "account_balance": 5000.0 }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.consensus_threshold - 0.6).abs() < f64::EPSILON);
        assert!((cfg.producer_weights["news_agent"] - 0.5).abs() < f64::EPSILON);
        assert!(!cfg.regime_multipliers.contains_key(&Regime::MomentumBreakout));
        assert!((cfg.risk.account_balance - 5000.0).abs() < f64::EPSILON);
        assert!((cfg.risk.pip_value - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.window_seconds = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.consensus_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.producer_weights.insert("x".into(), -1.0);
        assert!(cfg.validate().is_err());

        let cfg: EngineConfig =
            serde_json::from_str(r#"{"regime_multipliers":{"MOMENTUM_BREAKOUT":{"TREND_FOLLOWING":-1.0}}}"#)
                .unwrap();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.regime_multipliers
            .entry(Regime::MeanReversion)
            .or_default()
            .insert(ProducerStyle::MeanReversion, f64::NAN);
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.consensus_threshold = 0.4;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("brain-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");

        let mut cfg = EngineConfig::default();
        cfg.window_seconds = 15.0;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert!((loaded.window_seconds - 15.0).abs() < f64::EPSILON);
        assert_eq!(loaded.producer_styles, cfg.producer_styles);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(EngineConfig::load("/definitely/not/here.json").is_err());
    }
}
