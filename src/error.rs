// =============================================================================
// Errors — one enum per component, wrapped by the session with `#[from]`
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Timeframe parsing and validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeframeError {
    /// The code is not a known `<unit><size>` timeframe.
    #[error("unrecognized timeframe '{0}'")]
    Unrecognized(String),

    /// Tick-level timeframes cannot be aggregated into bars.
    #[error("timeframe '{0}' is tick-level; only bar timeframes are supported")]
    TickGranularity(String),
}

/// Historical request failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(#[from] TimeframeError),

    /// No response arrived within the caller-supplied bound.
    #[error("history request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The provider reported an error or cancelled the request.
    #[error("history request rejected: {0}")]
    RequestRejected(String),
}

/// Contract violations inside the period collection. These point at broken
/// upstream data or misuse and are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeriodError {
    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(#[from] TimeframeError),

    #[error("historical bar at {got} does not follow previous bar at {previous}")]
    OutOfOrderHistoricalBar {
        previous: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("historical bars cannot be added after the seam is closed")]
    HistoryAfterSeam,

    #[error("seam already closed at {existing:?}, refusing {requested:?}")]
    SeamMismatch {
        existing: Option<DateTime<Utc>>,
        requested: Option<DateTime<Utc>>,
    },

    /// Live ticks arrived before `finish` closed the seam.
    #[error("period collection is not finished; live ticks are not accepted yet")]
    NotReady,
}

/// Session-level failures surfaced to the caller.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A readiness signal did not fire within its bound.
    #[error("{stage} not ready after {timeout:?}")]
    NotReady { stage: &'static str, timeout: Duration },

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("price feed error: {0}")]
    Feed(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Period(#[from] PeriodError),
}
