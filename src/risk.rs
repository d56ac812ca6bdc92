// =============================================================================
// Risk Gate — approval and position sizing for consensus decisions
// =============================================================================
//
// The engine talks to risk through the `RiskGate` trait and always goes via
// `check_with_timeout`, which turns errors and timeouts into a denial.
//
// `DynamicRiskGate` is the reference collaborator:
//   - Lot sizing   — risk_amount / (stop_loss_pips * pip_value), rounded to
//                    the lot step and clamped to [min_lot, max_lot]. A zero
//                    or undefined stop distance yields min_lot.
//   - Breakers     — kill switch, daily trade limit, consecutive losses.
//                    Daily counters reset when the UTC date rolls over.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime_config::RiskParams;
use crate::types::{Outcome, RiskApproval, TradeSide};

// ---------------------------------------------------------------------------
// Gate contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RiskGate: Send + Sync {
    async fn check_risk(&self, instrument: &str, outcome: Outcome) -> anyhow::Result<RiskApproval>;

    /// Told after an approved order was filled.
    fn record_execution(&self, _instrument: &str, _side: TradeSide) {}

    /// Told when a position closes. Whoever tracks positions reports the PnL
    /// here so loss-based breakers can trip.
    fn record_trade_result(&self, _instrument: &str, _pnl: f64) {}
}

/// Ask `gate` with a deadline. Anything but a clean answer is a denial.
pub async fn check_with_timeout(
    gate: &dyn RiskGate,
    instrument: &str,
    outcome: Outcome,
    timeout: Duration,
) -> RiskApproval {
    match tokio::time::timeout(timeout, gate.check_risk(instrument, outcome)).await {
        Ok(Ok(approval)) => approval,
        Ok(Err(e)) => {
            warn!(instrument, outcome = %outcome, error = %e, "risk gate failed; denying");
            RiskApproval::deny(format!("risk gate unavailable: {e}"))
        }
        Err(_) => {
            warn!(
                instrument,
                outcome = %outcome,
                timeout_ms = timeout.as_millis() as u64,
                "risk gate timed out; denying"
            );
            RiskApproval::deny("risk gate timed out")
        }
    }
}

// ---------------------------------------------------------------------------
// Lot sizing
// ---------------------------------------------------------------------------

/// Risk-based lot size for a given stop distance.
pub fn calculate_lot_size(params: &RiskParams, stop_loss_pips: f64) -> f64 {
    let denominator = stop_loss_pips * params.pip_value;
    if !(denominator.is_finite() && denominator > 0.0) {
        return params.min_lot;
    }

    let risk_amount = params.account_balance * params.risk_per_trade;
    let raw = risk_amount / denominator;
    let stepped = if params.lot_step > 0.0 {
        (raw / params.lot_step).round() * params.lot_step
    } else {
        raw
    };

    if !stepped.is_finite() {
        return params.min_lot;
    }
    let upper = params.max_lot.max(params.min_lot);
    // Trim float noise from the step multiplication.
    let clamped = stepped.clamp(params.min_lot, upper);
    (clamped * 1e8).round() / 1e8
}

// ---------------------------------------------------------------------------
// Reference gate
// ---------------------------------------------------------------------------

/// Serialisable snapshot of the reference gate's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_trades_count: u32,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_pnl: f64,
    pub killed: bool,
    pub current_date: String,
}

struct Inner {
    daily_trades_count: u32,
    consecutive_losses: u32,
    daily_pnl: f64,
    current_date: String,
    killed: bool,
}

pub struct DynamicRiskGate {
    state: RwLock<Inner>,
    params: RiskParams,
}

impl DynamicRiskGate {
    pub fn new(params: RiskParams) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            account_balance = params.account_balance,
            risk_per_trade = params.risk_per_trade,
            stop_loss_pips = params.stop_loss_pips,
            max_daily_trades = params.max_daily_trades,
            max_consecutive_losses = params.max_consecutive_losses,
            "DynamicRiskGate initialised"
        );
        Self {
            state: RwLock::new(Inner {
                daily_trades_count: 0,
                consecutive_losses: 0,
                daily_pnl: 0.0,
                current_date: today,
                killed: false,
            }),
            params,
        }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    /// Evaluate the breakers and size the order.
    pub fn evaluate(&self, instrument: &str, outcome: Outcome) -> RiskApproval {
        if outcome == Outcome::Hold {
            return RiskApproval::deny("nothing to trade on HOLD");
        }

        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return RiskApproval::deny("Kill switch activated");
        }

        if s.daily_trades_count >= self.params.max_daily_trades {
            let msg = format!(
                "Trade Limit breaker tripped: {} trades today (limit {})",
                s.daily_trades_count, self.params.max_daily_trades
            );
            warn!(instrument, "{}", msg);
            return RiskApproval::deny(msg);
        }

        if s.consecutive_losses >= self.params.max_consecutive_losses {
            let msg = format!(
                "Consecutive Losses breaker tripped: {} consecutive losses (limit {})",
                s.consecutive_losses, self.params.max_consecutive_losses
            );
            warn!(instrument, "{}", msg);
            return RiskApproval::deny(msg);
        }

        let lot_size = calculate_lot_size(&self.params, self.params.stop_loss_pips);
        debug!(instrument, outcome = %outcome, lot_size, "risk approved");
        RiskApproval::approve(lot_size)
    }

    /// Count a dispatched order against the daily limit.
    pub fn record_trade_opened(&self) {
        self.maybe_reset_daily();
        self.state.write().daily_trades_count += 1;
    }

    /// Record the PnL of a closed trade.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_pnl += pnl;
        if pnl >= 0.0 {
            s.consecutive_losses = 0;
        } else {
            s.consecutive_losses += 1;
        }
        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            "trade result recorded"
        );
    }

    /// Block all trading until [`DynamicRiskGate::revive`].
    pub fn kill(&self) {
        self.state.write().killed = true;
        warn!("kill switch activated — all trading halted");
    }

    pub fn revive(&self) {
        self.state.write().killed = false;
        info!("kill switch cleared");
    }

    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskState {
            risk_mode: self.risk_mode(&s).to_string(),
            daily_trades_count: s.daily_trades_count,
            consecutive_losses: s.consecutive_losses,
            daily_pnl: s.daily_pnl,
            killed: s.killed,
            current_date: s.current_date.clone(),
        }
    }

    fn risk_mode(&self, s: &Inner) -> &'static str {
        if s.killed {
            "KILLED"
        } else if s.daily_trades_count >= self.params.max_daily_trades
            || s.consecutive_losses >= self.params.max_consecutive_losses
        {
            "BREAKER_TRIPPED"
        } else {
            "Normal"
        }
    }

    /// If the calendar date has changed since the last check, reset all daily
    /// counters automatically.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Another caller may have reset between the two locks.
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            s.daily_trades_count = 0;
            s.consecutive_losses = 0;
            s.daily_pnl = 0.0;
            s.current_date = today;
        }
    }
}

#[async_trait]
impl RiskGate for DynamicRiskGate {
    async fn check_risk(&self, instrument: &str, outcome: Outcome) -> anyhow::Result<RiskApproval> {
        Ok(self.evaluate(instrument, outcome))
    }

    fn record_execution(&self, _instrument: &str, _side: TradeSide) {
        self.record_trade_opened();
    }

    fn record_trade_result(&self, _instrument: &str, pnl: f64) {
        DynamicRiskGate::record_trade_result(self, pnl);
    }
}

impl std::fmt::Debug for DynamicRiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRiskGate")
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingGate;

    #[async_trait]
    impl RiskGate for FailingGate {
        async fn check_risk(&self, _: &str, _: Outcome) -> anyhow::Result<RiskApproval> {
            anyhow::bail!("connection refused")
        }
    }

    struct HangingGate;

    #[async_trait]
    impl RiskGate for HangingGate {
        async fn check_risk(&self, _: &str, _: Outcome) -> anyhow::Result<RiskApproval> {
            std::future::pending().await
        }
    }

    #[test]
    fn lot_size_reference_formula() {
        let params = RiskParams::default();
        // 10_000 * 0.01 / (20 * 10) = 0.5
        assert!((calculate_lot_size(&params, 20.0) - 0.5).abs() < 1e-9);
        // 100 / (30 * 10) = 0.333.. -> 0.33
        assert!((calculate_lot_size(&params, 30.0) - 0.33).abs() < 1e-9);
    }

    #[test]
    fn zero_or_undefined_stop_yields_min_lot() {
        let params = RiskParams::default();
        assert!((calculate_lot_size(&params, 0.0) - params.min_lot).abs() < 1e-12);
        assert!((calculate_lot_size(&params, f64::NAN) - params.min_lot).abs() < 1e-12);
        assert!((calculate_lot_size(&params, -5.0) - params.min_lot).abs() < 1e-12);
    }

    #[test]
    fn lot_size_is_clamped() {
        let params = RiskParams::default();
        // 100 / (100_000 * 10) rounds to 0 -> min lot
        assert!((calculate_lot_size(&params, 100_000.0) - params.min_lot).abs() < 1e-12);
        let params = RiskParams {
            max_lot: 1.0,
            ..RiskParams::default()
        };
        assert!((calculate_lot_size(&params, 0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hold_is_denied() {
        let gate = DynamicRiskGate::new(RiskParams::default());
        assert!(!gate.evaluate("EUR/USD", Outcome::Hold).allowed);
    }

    #[test]
    fn approves_with_lot_size() {
        let gate = DynamicRiskGate::new(RiskParams::default());
        let approval = gate.evaluate("EUR/USD", Outcome::Buy);
        assert!(approval.allowed);
        assert!((approval.lot_size - 0.5).abs() < 1e-9);
    }

    #[test]
    fn trade_limit_breaker() {
        let gate = DynamicRiskGate::new(RiskParams {
            max_daily_trades: 2,
            ..RiskParams::default()
        });
        gate.record_trade_opened();
        assert!(gate.evaluate("EUR/USD", Outcome::Sell).allowed);
        gate.record_trade_opened();
        let denied = gate.evaluate("EUR/USD", Outcome::Sell);
        assert!(!denied.allowed);
        assert!(denied.reason.contains("Trade Limit"));
        assert_eq!(gate.get_state().risk_mode, "BREAKER_TRIPPED");
    }

    #[test]
    fn consecutive_losses_breaker_resets_on_win() {
        let gate = DynamicRiskGate::new(RiskParams {
            max_consecutive_losses: 2,
            ..RiskParams::default()
        });
        gate.record_trade_result(-10.0);
        gate.record_trade_result(-10.0);
        assert!(!gate.evaluate("EUR/USD", Outcome::Buy).allowed);
        gate.record_trade_result(5.0);
        assert!(gate.evaluate("EUR/USD", Outcome::Buy).allowed);
        assert!((gate.get_state().daily_pnl + 15.0).abs() < 1e-9);
    }

    #[test]
    fn kill_switch_blocks_until_revived() {
        let gate = DynamicRiskGate::new(RiskParams::default());
        gate.kill();
        assert_eq!(gate.evaluate("EUR/USD", Outcome::Buy).reason, "Kill switch activated");
        assert_eq!(gate.get_state().risk_mode, "KILLED");
        gate.revive();
        assert!(gate.evaluate("EUR/USD", Outcome::Buy).allowed);
    }

    #[tokio::test]
    async fn failing_gate_is_a_denial() {
        let approval =
            check_with_timeout(&FailingGate, "EUR/USD", Outcome::Buy, Duration::from_millis(100)).await;
        assert!(!approval.allowed);
        assert!(approval.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn hanging_gate_times_out_to_denial() {
        let approval =
            check_with_timeout(&HangingGate, "EUR/USD", Outcome::Buy, Duration::from_millis(20)).await;
        assert!(!approval.allowed);
        assert_eq!(approval.reason, "risk gate timed out");
    }

    #[tokio::test]
    async fn dynamic_gate_through_trait() {
        let gate = DynamicRiskGate::new(RiskParams::default());
        let approval = check_with_timeout(&gate, "EUR/USD", Outcome::Sell, Duration::from_secs(1)).await;
        assert!(approval.allowed);

        RiskGate::record_execution(&gate, "EUR/USD", TradeSide::Sell);
        assert_eq!(gate.get_state().daily_trades_count, 1);

        RiskGate::record_trade_result(&gate, "EUR/USD", -12.5);
        let state = gate.get_state();
        assert_eq!(state.consecutive_losses, 1);
        assert!((state.daily_pnl + 12.5).abs() < 1e-9);
    }
}
