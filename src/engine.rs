// =============================================================================
// Brain — the consumer loop and the evaluation pipeline
// =============================================================================
//
//   bus message ─► ingest ─┬─ status ─► regime classifier
//                          └─ signal ─► window ─► consensus ─► audit
//                                                    │
//                                     actionable ─► risk gate ─► audit
//                                                    │
//                                        allowed ─► coordinator (spawned)
//                                                    │
//                                                 result ─► audit
//
// The loop never blocks on order placement: dispatch runs on its own task.
// The in-flight lock is taken before the window is scored and is held from
// then until the order resolves, so a second decision for the same
// instrument is rejected while the first is outstanding.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, BusPublisher, BusSubscription};
use crate::consensus::{ConsensusEngine, Decision};
use crate::execution::{ExecutionCoordinator, ExecutionResult, OrderExecutor, OrderRequest};
use crate::publisher::DecisionPublisher;
use crate::regime::{Regime, RegimeClassifier};
use crate::risk::{check_with_timeout, RiskGate};
use crate::runtime_config::EngineConfig;
use crate::signals::{IngestError, Ingested, RegimeMultipliers, SignalIngestor, SignalWindow, WeightStore, WeightTable};
use crate::types::RiskApproval;

/// How long one receive may block before the running flag is re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Pause after a message handler fails.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What became of one bus message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Malformed or unusable; logged and dropped.
    Dropped(IngestError),
    /// Auxiliary status applied; carries the regime it produced.
    StatusObserved(Regime),
    /// A signal triggered an evaluation.
    Evaluated(Evaluation),
}

/// The full trail of one evaluation.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: Decision,
    /// `None` when the risk gate was not consulted (HOLD, or in flight).
    pub risk: Option<RiskApproval>,
    pub dispatch: Dispatch,
}

#[derive(Debug)]
pub enum Dispatch {
    /// HOLD, or the risk gate said no.
    NotAttempted,
    /// Another evaluation or order for the instrument held the lock.
    InFlight,
    /// Order handed to the coordinator; resolves once the result is audited.
    Spawned(JoinHandle<ExecutionResult>),
}

pub struct Brain {
    window: Arc<SignalWindow>,
    ingestor: SignalIngestor,
    regime: RegimeClassifier,
    consensus: ConsensusEngine,
    weights: Arc<WeightStore>,
    risk: Arc<dyn RiskGate>,
    coordinator: Arc<ExecutionCoordinator>,
    publisher: Arc<DecisionPublisher>,
    risk_timeout: Duration,
    running: AtomicBool,
}

impl Brain {
    pub fn new(
        config: &EngineConfig,
        bus: Arc<dyn BusPublisher>,
        risk: Arc<dyn RiskGate>,
        executor: Arc<dyn OrderExecutor>,
    ) -> Self {
        let window = Arc::new(SignalWindow::new(config.window_seconds));
        let ingestor = SignalIngestor::new(
            window.clone(),
            config.default_confidence,
            config.bus.status_topics.clone(),
        );
        let multipliers = RegimeMultipliers::new(
            config.producer_styles.clone(),
            config.regime_multipliers.clone(),
        );
        let consensus = ConsensusEngine::new(window.clone(), multipliers, config.consensus_threshold);
        let weights = Arc::new(WeightStore::new(WeightTable::new(config.producer_weights.clone())));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            executor,
            window.clone(),
            Duration::from_secs_f64(config.execution_timeout_secs),
        ));
        let publisher = Arc::new(DecisionPublisher::new(bus, config.bus.audit_topic.clone()));

        info!(
            window_seconds = config.window_seconds,
            threshold = config.consensus_threshold,
            producers = config.producer_weights.len(),
            audit_topic = %config.bus.audit_topic,
            "brain initialised"
        );

        Self {
            window,
            ingestor,
            regime: RegimeClassifier::new(config.regime_stale_secs),
            consensus,
            weights,
            risk,
            coordinator,
            publisher,
            risk_timeout: Duration::from_millis(config.risk_timeout_ms),
            running: AtomicBool::new(true),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn window(&self) -> &Arc<SignalWindow> {
        &self.window
    }

    /// Writer handle for the learning collaborator.
    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    pub fn publisher(&self) -> &Arc<DecisionPublisher> {
        &self.publisher
    }

    pub fn regime(&self) -> Regime {
        self.regime.current()
    }

    /// Feed a closed trade's PnL to the risk gate.
    pub fn report_trade_result(&self, instrument: &str, pnl: f64) {
        info!(instrument, pnl, "trade result reported");
        self.risk.record_trade_result(instrument, pnl);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the consumer loop to exit after the current message.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("brain stop requested");
        }
    }

    // ── Consumer loop ────────────────────────────────────────────────────

    /// Consume `subscription` until [`Brain::stop`] is called or the
    /// subscription closes.
    pub async fn run<S: BusSubscription>(self: &Arc<Self>, mut subscription: S) {
        info!("consumer loop started");

        while self.is_running() {
            let msg = match tokio::time::timeout(POLL_INTERVAL, subscription.next_message()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!("subscription closed — consumer loop exiting");
                    break;
                }
                Err(_) => {
                    let evicted = self.window.evict_all_at(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "expired signals evicted");
                    }
                    continue;
                }
            };

            let brain = self.clone();
            let topic = msg.topic.clone();
            let handled = tokio::spawn(async move { brain.handle_message(&msg).await }).await;
            if let Err(e) = handled {
                error!(topic = %topic, error = %e, "message handler failed — backing off");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }

        info!("consumer loop stopped");
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    /// Process one bus message end to end.
    pub async fn handle_message(&self, msg: &BusMessage) -> MessageOutcome {
        match self.ingestor.ingest(&msg.topic, &msg.payload) {
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "dropping message");
                MessageOutcome::Dropped(e)
            }
            Ok(Ingested::Status(update)) => {
                self.regime.observe(&update);
                MessageOutcome::StatusObserved(self.regime.classify())
            }
            Ok(Ingested::Signal(signal)) => {
                MessageOutcome::Evaluated(self.evaluate(&signal.instrument).await)
            }
        }
    }

    /// Evaluate `instrument` against its current window and act on the result.
    ///
    /// The in-flight lock is taken before the window is read and held
    /// through the risk call, so a fill from an earlier order can never clear
    /// the window between scoring and dispatch.
    pub async fn evaluate(&self, instrument: &str) -> Evaluation {
        let guard = self.coordinator.try_acquire(instrument);
        let regime = self.regime.classify();
        let weights = self.weights.current();
        let decision = self.consensus.evaluate(instrument, &weights, regime);

        let Some(side) = decision.outcome.side() else {
            drop(guard);
            debug!(
                instrument,
                buy = decision.buy_power,
                sell = decision.sell_power,
                total = decision.total_weight,
                regime = %regime,
                "HOLD"
            );
            self.publisher.publish_decision(&decision).await;
            return Evaluation {
                decision,
                risk: None,
                dispatch: Dispatch::NotAttempted,
            };
        };

        info!(
            instrument,
            outcome = %decision.outcome,
            confidence_pct = format!("{:.1}", decision.confidence_pct),
            regime = %regime,
            "consensus reached"
        );
        self.publisher.publish_decision(&decision).await;

        let Some(guard) = guard else {
            info!(instrument, "order already in flight — decision not executed");
            self.publisher
                .publish_execution(decision.id, instrument, &ExecutionResult::InFlight)
                .await;
            return Evaluation {
                decision,
                risk: None,
                dispatch: Dispatch::InFlight,
            };
        };

        let mut approval =
            check_with_timeout(self.risk.as_ref(), instrument, decision.outcome, self.risk_timeout).await;
        if approval.allowed && !(approval.lot_size.is_finite() && approval.lot_size > 0.0) {
            warn!(instrument, lot_size = approval.lot_size, "risk approval without a usable lot size");
            approval = RiskApproval::deny(format!("unusable lot size {}", approval.lot_size));
        }
        self.publisher.publish_risk(&decision, &approval).await;

        if !approval.allowed {
            info!(instrument, reason = %approval.reason, "risk gate denied trade");
            return Evaluation {
                decision,
                risk: Some(approval),
                dispatch: Dispatch::NotAttempted,
            };
        }

        let order = OrderRequest {
            decision_id: decision.id,
            instrument: instrument.to_string(),
            side,
            volume: approval.lot_size,
        };
        let coordinator = self.coordinator.clone();
        let publisher = self.publisher.clone();
        let risk = self.risk.clone();
        let handle = tokio::spawn(async move {
            let decision_id = order.decision_id;
            let instrument = order.instrument.clone();
            let result = coordinator.dispatch(guard, order).await;
            if result.is_filled() {
                risk.record_execution(&instrument, side);
            }
            publisher.publish_execution(decision_id, &instrument, &result).await;
            result
        });

        Evaluation {
            decision,
            risk: Some(approval),
            dispatch: Dispatch::Spawned(handle),
        }
    }
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("window", &self.window)
            .field("regime", &self.regime.current())
            .field("coordinator", &self.coordinator)
            .field("running", &self.is_running())
            .finish()
    }
}
