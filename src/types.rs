// =============================================================================
// Shared types used across the live bar pipeline
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bid/ask OHLC bar. `timestamp` is the bucket start under the active
/// timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub bid_open: f64,
    pub bid_high: f64,
    pub bid_low: f64,
    pub bid_close: f64,
    pub ask_open: f64,
    pub ask_high: f64,
    pub ask_low: f64,
    pub ask_close: f64,
    pub volume: f64,
}

impl Bar {
    /// Seed a fresh bar from the first tick of a bucket.
    pub fn from_tick(bucket: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            timestamp: bucket,
            bid_open: tick.bid,
            bid_high: tick.bid,
            bid_low: tick.bid,
            bid_close: tick.bid,
            ask_open: tick.ask,
            ask_high: tick.ask,
            ask_low: tick.ask,
            ask_close: tick.ask,
            volume: tick.volume,
        }
    }

    /// Fold a tick into this bar's high/low/close. Volume is handled by the
    /// caller because the seam baseline needs to decide it.
    pub fn extend_prices(&mut self, tick: &Tick) {
        self.bid_high = self.bid_high.max(tick.bid);
        self.bid_low = self.bid_low.min(tick.bid);
        self.bid_close = tick.bid;
        self.ask_high = self.ask_high.max(tick.ask);
        self.ask_low = self.ask_low.min(tick.ask);
        self.ask_close = tick.ask;
    }
}

/// A single live price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Feed sequence number, strictly increasing in arrival order within one
    /// subscription.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    /// Volume increment carried by this tick.
    pub volume: f64,
}

/// Hand-off point between history and the live-only region: the last
/// historical bar's open time and its volume as the provider reported them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeamMarker {
    pub timestamp: DateTime<Utc>,
    pub volume: f64,
}

/// Read-only copy of a period collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSnapshot {
    pub instrument: String,
    pub timeframe: String,
    pub closed: Vec<Bar>,
    pub open: Option<Bar>,
}

impl PeriodSnapshot {
    /// All bars in order, the open one (if any) last.
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.closed.iter().chain(self.open.iter())
    }

    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.open.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
