// =============================================================================
// Live Bars — historical + real-time bar collection with a seamless seam
// =============================================================================

pub mod config;
pub mod error;
pub mod market_data;
pub mod provider;
pub mod session;
pub mod timeframe;
pub mod types;
