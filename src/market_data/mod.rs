pub mod history;
pub mod live_bridge;
pub mod observer;
pub mod period_collection;
pub mod tick_buffer;

pub use history::{HistoricalBatch, HistoryLoader};
pub use live_bridge::{LiveBridge, Routed};
pub use observer::UpdateObserver;
pub use period_collection::{FinishReport, PeriodCollection, PeriodEvent, TickOutcome};
pub use tick_buffer::TickBuffer;
