// =============================================================================
// Consensus Brain — weighted-vote decision engine for a multi-producer
// trading system
// =============================================================================

pub mod bus;
pub mod consensus;
pub mod engine;
pub mod execution;
pub mod publisher;
pub mod redis_bus;
pub mod regime;
pub mod risk;
pub mod runtime_config;
pub mod signals;
pub mod types;

pub use consensus::{ConsensusEngine, Decision};
pub use engine::{Brain, Dispatch, Evaluation, MessageOutcome};
pub use runtime_config::EngineConfig;
pub use types::{Direction, Outcome, RiskApproval, Signal, TradeSide};
