// =============================================================================
// Signals Module
// =============================================================================
//
// Inbound side of the pipeline:
// - Ingestion of raw bus messages into canonical `Signal` records
// - Per-instrument time-bounded signal window
// - Producer weight table and regime multipliers

pub mod ingest;
pub mod weights;
pub mod window;

pub use ingest::{IngestError, Ingested, SignalIngestor};
pub use weights::{ProducerStyle, RegimeMultipliers, WeightStore, WeightTable};
pub use window::SignalWindow;
