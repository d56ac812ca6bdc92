// =============================================================================
// Regime Module
// =============================================================================
//
// Coarse market regime classification from auxiliary status topics
// (volatility state, session liquidity, news flag).

pub mod classifier;

pub use classifier::{
    Liquidity, MarketConditions, Regime, RegimeClassifier, StatusUpdate, VolatilityState,
};
