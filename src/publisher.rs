// =============================================================================
// Decision Publisher — audit record of every evaluation
// =============================================================================
//
// Every decision goes to the audit topic, HOLD included, with the full
// numeric breakdown. Risk verdicts and execution results are published as
// separate records carrying the same `decision_id`. Publishing never fails
// the pipeline: bus errors are logged and the record is still kept in the
// in-memory ring.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::BusPublisher;
use crate::consensus::Decision;
use crate::execution::ExecutionResult;
use crate::regime::Regime;
use crate::types::{Outcome, RiskApproval};

/// Maximum number of recent audit records to retain.
const MAX_RECENT_RECORDS: usize = 100;

/// One record on the audit topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    Decision {
        decision_id: Uuid,
        instrument: String,
        buy: f64,
        sell: f64,
        total_weight: f64,
        decision: Outcome,
        /// 0..100
        confidence: f64,
        regime: Regime,
        abstentions: usize,
        evaluated_at: DateTime<Utc>,
    },
    Risk {
        decision_id: Uuid,
        instrument: String,
        allowed: bool,
        reason: String,
        lot_size: f64,
        at: DateTime<Utc>,
    },
    Execution {
        decision_id: Uuid,
        instrument: String,
        result: String,
        at: DateTime<Utc>,
    },
}

impl AuditRecord {
    pub fn decision_id(&self) -> Uuid {
        match self {
            Self::Decision { decision_id, .. }
            | Self::Risk { decision_id, .. }
            | Self::Execution { decision_id, .. } => *decision_id,
        }
    }
}

impl From<&Decision> for AuditRecord {
    fn from(d: &Decision) -> Self {
        Self::Decision {
            decision_id: d.id,
            instrument: d.instrument.clone(),
            buy: d.buy_power,
            sell: d.sell_power,
            total_weight: d.total_weight,
            decision: d.outcome,
            confidence: d.confidence_pct,
            regime: d.regime,
            abstentions: d.abstentions,
            evaluated_at: d.evaluated_at,
        }
    }
}

pub struct DecisionPublisher {
    bus: Arc<dyn BusPublisher>,
    topic: String,
    recent: RwLock<VecDeque<AuditRecord>>,
}

impl DecisionPublisher {
    pub fn new(bus: Arc<dyn BusPublisher>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_RECORDS)),
        }
    }

    pub async fn publish_decision(&self, decision: &Decision) {
        self.publish(AuditRecord::from(decision)).await;
    }

    pub async fn publish_risk(&self, decision: &Decision, approval: &RiskApproval) {
        self.publish(AuditRecord::Risk {
            decision_id: decision.id,
            instrument: decision.instrument.clone(),
            allowed: approval.allowed,
            reason: approval.reason.clone(),
            lot_size: approval.lot_size,
            at: Utc::now(),
        })
        .await;
    }

    pub async fn publish_execution(&self, decision_id: Uuid, instrument: &str, result: &ExecutionResult) {
        self.publish(AuditRecord::Execution {
            decision_id,
            instrument: instrument.to_string(),
            result: result.to_string(),
            at: Utc::now(),
        })
        .await;
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.recent.read().iter().cloned().collect()
    }

    async fn publish(&self, record: AuditRecord) {
        {
            let mut recent = self.recent.write();
            recent.push_back(record.clone());
            while recent.len() > MAX_RECENT_RECORDS {
                recent.pop_front();
            }
        }

        let payload = match serde_json::to_string(&record) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise audit record");
                return;
            }
        };

        match self.bus.publish(&self.topic, payload).await {
            Ok(()) => debug!(topic = %self.topic, decision_id = %record.decision_id(), "audit record published"),
            Err(e) => warn!(topic = %self.topic, error = %e, "failed to publish audit record"),
        }
    }
}
