// =============================================================================
// Execution Coordinator — at most one in-flight order per instrument
// =============================================================================
//
// Approved decisions reach the execution collaborator only through here.
// The coordinator:
//   - refuses a submission while the instrument's in-flight lock is held,
//   - takes the lock before dispatch and releases it when the guard drops
//     (success, failure, timeout or a panicking task alike),
//   - bounds every dispatch with a timeout,
//   - clears the instrument's signal window after a fill so the same votes
//     cannot fire a second order. On failure the window is left alone.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::signals::SignalWindow;
use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Collaborator contract
// ---------------------------------------------------------------------------

/// The mechanism that physically places an order. May be slow.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// `Ok(true)` on a confirmed fill, `Ok(false)` when the venue declined.
    async fn place_order(&self, instrument: &str, side: TradeSide, volume: f64) -> anyhow::Result<bool>;
}

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub decision_id: Uuid,
    pub instrument: String,
    pub side: TradeSide,
    pub volume: f64,
}

/// Outcome of an execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Collaborator confirmed the order; the window was cleared.
    Filled,
    /// Another order for the instrument is still outstanding.
    InFlight,
    /// Collaborator answered but did not place the order.
    Declined,
    /// Collaborator raised an error.
    Failed(String),
    /// No answer within the dispatch timeout.
    TimedOut,
}

impl ExecutionResult {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled)
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "Filled"),
            Self::InFlight => write!(f, "InFlight"),
            Self::Declined => write!(f, "Declined"),
            Self::Failed(err) => write!(f, "Failed({err})"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight lock
// ---------------------------------------------------------------------------

/// Proof that an instrument's in-flight lock is held. Dropping it releases.
#[derive(Debug)]
pub struct InFlightGuard {
    instrument: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl InFlightGuard {
    pub fn instrument(&self) -> &str {
        &self.instrument
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.instrument);
        debug!(instrument = %self.instrument, "in-flight lock released");
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ExecutionCoordinator {
    executor: Arc<dyn OrderExecutor>,
    window: Arc<SignalWindow>,
    held: Arc<Mutex<HashSet<String>>>,
    timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(executor: Arc<dyn OrderExecutor>, window: Arc<SignalWindow>, timeout: Duration) -> Self {
        Self {
            executor,
            window,
            held: Arc::new(Mutex::new(HashSet::new())),
            timeout,
        }
    }

    /// Take the in-flight lock for `instrument`, or `None` if already held.
    pub fn try_acquire(&self, instrument: &str) -> Option<InFlightGuard> {
        let mut held = self.held.lock();
        if !held.insert(instrument.to_string()) {
            return None;
        }
        debug!(instrument, "in-flight lock acquired");
        Some(InFlightGuard {
            instrument: instrument.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_in_flight(&self, instrument: &str) -> bool {
        self.held.lock().contains(instrument)
    }

    /// Acquire and dispatch in one step.
    pub async fn submit(&self, order: OrderRequest) -> ExecutionResult {
        match self.try_acquire(&order.instrument) {
            Some(guard) => self.dispatch(guard, order).await,
            None => {
                info!(
                    instrument = %order.instrument,
                    side = %order.side,
                    "order already in flight — submission rejected"
                );
                ExecutionResult::InFlight
            }
        }
    }

    /// Send `order` to the collaborator while holding `guard`.
    pub async fn dispatch(&self, guard: InFlightGuard, order: OrderRequest) -> ExecutionResult {
        debug_assert_eq!(guard.instrument(), order.instrument);
        info!(
            instrument = %order.instrument,
            side = %order.side,
            volume = order.volume,
            decision_id = %order.decision_id,
            "dispatching order"
        );

        let placed = tokio::time::timeout(
            self.timeout,
            self.executor
                .place_order(&order.instrument, order.side, order.volume),
        )
        .await;

        let result = match placed {
            Ok(Ok(true)) => {
                self.window.clear(&order.instrument);
                info!(instrument = %order.instrument, side = %order.side, "order filled — window cleared");
                ExecutionResult::Filled
            }
            Ok(Ok(false)) => {
                warn!(instrument = %order.instrument, side = %order.side, "order declined by executor");
                ExecutionResult::Declined
            }
            Ok(Err(e)) => {
                warn!(instrument = %order.instrument, side = %order.side, error = %e, "order placement failed");
                ExecutionResult::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    instrument = %order.instrument,
                    side = %order.side,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "order placement timed out"
                );
                ExecutionResult::TimedOut
            }
        };

        drop(guard);
        result
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("executor", &"<OrderExecutor>")
            .field("in_flight", &self.held.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Paper executor
// ---------------------------------------------------------------------------

/// A simulated fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperFill {
    pub order_id: String,
    pub instrument: String,
    pub side: TradeSide,
    pub volume: f64,
    pub filled_at: DateTime<Utc>,
}

/// Fills every order locally. No request leaves the process.
#[derive(Default)]
pub struct PaperExecutor {
    fills: RwLock<Vec<PaperFill>>,
    latency: Duration,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay each fill by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            fills: RwLock::new(Vec::new()),
            latency,
        }
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.fills.read().clone()
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn place_order(&self, instrument: &str, side: TradeSide, volume: f64) -> anyhow::Result<bool> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fill = PaperFill {
            order_id: Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            side,
            volume,
            filled_at: Utc::now(),
        };
        info!(
            instrument,
            side = %side,
            volume,
            order_id = %fill.order_id,
            "paper fill"
        );
        self.fills.write().push(fill);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Signal};

    struct FailingExecutor;

    #[async_trait]
    impl OrderExecutor for FailingExecutor {
        async fn place_order(&self, _: &str, _: TradeSide, _: f64) -> anyhow::Result<bool> {
            anyhow::bail!("terminal not logged in")
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl OrderExecutor for HangingExecutor {
        async fn place_order(&self, _: &str, _: TradeSide, _: f64) -> anyhow::Result<bool> {
            std::future::pending().await
        }
    }

    fn order(instrument: &str) -> OrderRequest {
        OrderRequest {
            decision_id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            side: TradeSide::Buy,
            volume: 0.5,
        }
    }

    fn filled_window() -> Arc<SignalWindow> {
        let window = Arc::new(SignalWindow::new(10.0));
        window.append(
            "EUR/USD",
            Signal::new("a", "EUR/USD", Direction::Buy, 0.9, Utc::now()),
        );
        window
    }

    #[tokio::test]
    async fn fill_clears_window_and_releases_lock() {
        let window = filled_window();
        let paper = Arc::new(PaperExecutor::new());
        let coord = ExecutionCoordinator::new(paper.clone(), window.clone(), Duration::from_secs(1));

        let result = coord.submit(order("EUR/USD")).await;
        assert_eq!(result, ExecutionResult::Filled);
        assert!(window.snapshot("EUR/USD").is_empty());
        assert!(!coord.is_in_flight("EUR/USD"));
        assert_eq!(paper.fills().len(), 1);
        assert!((paper.fills()[0].volume - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failure_keeps_window_and_releases_lock() {
        let window = filled_window();
        let coord = ExecutionCoordinator::new(Arc::new(FailingExecutor), window.clone(), Duration::from_secs(1));

        let result = coord.submit(order("EUR/USD")).await;
        assert!(matches!(result, ExecutionResult::Failed(ref e) if e.contains("not logged in")));
        assert_eq!(window.snapshot("EUR/USD").len(), 1);
        assert!(!coord.is_in_flight("EUR/USD"));
    }

    #[tokio::test]
    async fn timeout_releases_lock() {
        let window = filled_window();
        let coord = ExecutionCoordinator::new(Arc::new(HangingExecutor), window.clone(), Duration::from_millis(20));

        assert_eq!(coord.submit(order("EUR/USD")).await, ExecutionResult::TimedOut);
        assert!(!coord.is_in_flight("EUR/USD"));
        assert_eq!(window.snapshot("EUR/USD").len(), 1);
    }

    #[tokio::test]
    async fn second_submission_rejected_while_in_flight() {
        let window = filled_window();
        let coord = Arc::new(ExecutionCoordinator::new(
            Arc::new(PaperExecutor::with_latency(Duration::from_millis(50))),
            window,
            Duration::from_secs(1),
        ));

        let guard = coord.try_acquire("EUR/USD").expect("lock free");
        let task = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.dispatch(guard, order("EUR/USD")).await })
        };
        assert!(coord.is_in_flight("EUR/USD"));
        assert_eq!(coord.submit(order("EUR/USD")).await, ExecutionResult::InFlight);

        // Other instruments are unaffected.
        assert_eq!(coord.submit(order("GBP/USD")).await, ExecutionResult::Filled);

        assert_eq!(task.await.unwrap(), ExecutionResult::Filled);
        assert!(!coord.is_in_flight("EUR/USD"));
    }

    #[test]
    fn guard_drop_releases() {
        let coord = ExecutionCoordinator::new(
            Arc::new(PaperExecutor::new()),
            Arc::new(SignalWindow::default()),
            Duration::from_secs(1),
        );
        let guard = coord.try_acquire("EUR/USD").unwrap();
        assert!(coord.try_acquire("EUR/USD").is_none());
        drop(guard);
        assert!(coord.try_acquire("EUR/USD").is_some());
    }

    #[test]
    fn result_display() {
        assert_eq!(format!("{}", ExecutionResult::Failed("x".into())), "Failed(x)");
        assert_eq!(format!("{}", ExecutionResult::TimedOut), "TimedOut");
    }
}
