// =============================================================================
// Provider seams — session, live feed and history collaborators
// =============================================================================
//
// Transport, credentials and wire formats live behind these traits. The core
// only sees status signals, a tick receiver and a request/response exchange.
// =============================================================================

pub mod simulated;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::timeframe::Timeframe;
use crate::types::{Bar, Tick};

pub use simulated::{SimulatedMarket, SimulationScript};

/// Largest bar count a single history request may ask for.
pub const MAX_BARS_PER_REQUEST: u32 = 10_000;

/// Login lifecycle as reported by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

/// Login/logout against the market-data service.
pub trait MarketSession: Send + Sync {
    /// Start logging in. The receiver reports progress until `Connected` or
    /// `Failed`.
    fn login(&self) -> watch::Receiver<SessionStatus>;

    fn logout(&self);
}

/// Push source of live ticks for one instrument.
pub trait PriceFeed: Send + Sync {
    /// Subscribe to ticks. The channel closes when the feed disconnects.
    fn subscribe(&self, instrument: &str) -> anyhow::Result<mpsc::Receiver<Tick>>;
}

/// One bounded historical request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub id: Uuid,
    pub instrument: String,
    pub timeframe: Timeframe,
    /// `None` = unbounded.
    pub from: Option<DateTime<Utc>>,
    /// `None` = up to now.
    pub to: Option<DateTime<Utc>>,
    /// `None` = provider default count.
    pub max_count: Option<u32>,
}

impl HistoryRequest {
    /// Build a request; a non-positive `count` asks for the provider default.
    pub fn new(
        instrument: impl Into<String>,
        timeframe: Timeframe,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        count: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            timeframe,
            from,
            to,
            max_count: u32::try_from(count).ok().filter(|c| *c > 0),
        }
    }
}

/// Provider answer to a `HistoryRequest`.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryResponse {
    Completed {
        bars: Vec<Bar>,
        last_bar_time: Option<DateTime<Utc>>,
        last_bar_volume: f64,
    },
    Failed(String),
    Cancelled,
}

/// Request/response exchange for historical bars.
pub trait HistoryProvider: Send + Sync {
    /// `true` once the provider can accept requests.
    fn readiness(&self) -> watch::Receiver<bool>;

    fn send_request(&self, request: HistoryRequest) -> oneshot::Receiver<HistoryResponse>;
}
