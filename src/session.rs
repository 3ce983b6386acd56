// =============================================================================
// Live Session — login, history, seam hand-off and streaming until cancelled
// =============================================================================
//
// State machine:
//
//   Disconnected → AwaitingLogin → Ready → AwaitingHistorical → Streaming
//                                                                   ↓
//                                                               Cancelled
//
// Any failure returns to Disconnected. Every wait is bounded by its own
// timeout and every stage can be interrupted by the caller's cancel future.
// Cleanup always runs: the bridge is detached, the feed pump stopped, and
// logout attempted.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SessionError;
use crate::market_data::{HistoryLoader, LiveBridge, PeriodCollection, TickBuffer};
use crate::provider::{HistoryProvider, HistoryRequest, MarketSession, PriceFeed, SessionStatus};
use crate::timeframe::Timeframe;
use crate::types::{PeriodSnapshot, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    AwaitingLogin,
    Ready,
    AwaitingHistorical,
    Streaming,
    Cancelled,
}

impl SessionState {
    /// Forward edges of the state machine. Any state may fall back to
    /// `Disconnected` or jump to `Cancelled`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, AwaitingLogin)
                | (AwaitingLogin, Ready)
                | (Ready, AwaitingHistorical)
                | (AwaitingHistorical, Streaming)
                | (_, Cancelled)
                | (_, Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::AwaitingLogin => "AwaitingLogin",
            Self::Ready => "Ready",
            Self::AwaitingHistorical => "AwaitingHistorical",
            Self::Streaming => "Streaming",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// What to load and how long each stage may take.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Non-positive = provider default.
    pub count: i32,
    pub login_timeout: Duration,
    pub ready_timeout: Duration,
    pub history_timeout: Duration,
}

/// The excluded collaborators the session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub session: Arc<dyn MarketSession>,
    pub feed: Arc<dyn PriceFeed>,
    pub history: Arc<dyn HistoryProvider>,
}

pub struct LiveSession {
    settings: SessionSettings,
    collaborators: Collaborators,
    state: watch::Sender<SessionState>,
    transitions: Mutex<Vec<SessionState>>,
    feed_closed: Arc<watch::Sender<bool>>,
    collection: RwLock<Option<Arc<PeriodCollection>>>,
}

impl LiveSession {
    pub fn new(settings: SessionSettings, collaborators: Collaborators) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (feed_closed, _) = watch::channel(false);
        Self {
            settings,
            collaborators,
            state,
            transitions: Mutex::new(vec![SessionState::Disconnected]),
            feed_closed: Arc::new(feed_closed),
            collection: RwLock::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> Vec<SessionState> {
        self.transitions.lock().clone()
    }

    /// The collection being built, once the session has created it.
    pub fn collection(&self) -> Option<Arc<PeriodCollection>> {
        self.collection.read().clone()
    }

    pub fn snapshot(&self) -> Option<PeriodSnapshot> {
        self.collection().map(|c| c.snapshot())
    }

    /// Wait until the live feed has disconnected and every tick it delivered
    /// has been routed. Returns `false` on timeout.
    pub async fn wait_feed_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.feed_closed.subscribe();
        let closed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|closed| *closed)).await,
            Ok(Ok(_))
        );
        closed
    }

    fn transition(&self, next: SessionState) {
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        if !previous.can_advance_to(next) {
            warn!(from = %previous, to = %next, "unexpected session transition");
        }
        info!(from = %previous, to = %next, "session state");
        self.transitions.lock().push(next);
        self.state.send_replace(next);
    }

    /// Run the whole session until `cancel` resolves, then return the final
    /// bars. Failures at any stage abort cleanly.
    pub async fn run<F>(&self, cancel: F) -> Result<PeriodSnapshot, SessionError>
    where
        F: Future<Output = ()>,
    {
        let collection = Arc::new(PeriodCollection::new(
            self.settings.instrument.clone(),
            self.settings.timeframe,
        )?);
        *self.collection.write() = Some(collection.clone());

        let buffer = Arc::new(TickBuffer::new());
        let bridge = Arc::new(LiveBridge::new());
        let pump: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

        let outcome = tokio::select! {
            res = self.drive(&collection, &buffer, &bridge, &pump) => res,
            _ = cancel => {
                info!("cancellation requested");
                Ok(())
            }
        };

        bridge.detach();
        buffer.stop();
        if let Some(handle) = pump.lock().take() {
            handle.abort();
        }
        self.collaborators.session.logout();

        match outcome {
            Ok(()) => {
                self.transition(SessionState::Cancelled);
                let snapshot = collection.snapshot();
                info!(
                    instrument = %snapshot.instrument,
                    bars = snapshot.len(),
                    forwarded = bridge.forwarded(),
                    "session finished"
                );
                Ok(snapshot)
            }
            Err(e) => {
                error!(error = %e, "session aborted");
                self.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Everything up to streaming. Only returns on failure; streaming lasts
    /// until the caller's cancel future wins the select.
    async fn drive(
        &self,
        collection: &Arc<PeriodCollection>,
        buffer: &Arc<TickBuffer>,
        bridge: &Arc<LiveBridge>,
        pump: &Mutex<Option<JoinHandle<()>>>,
    ) -> Result<(), SessionError> {
        let settings = &self.settings;

        self.transition(SessionState::AwaitingLogin);
        self.await_login().await?;

        let mut ready = self.collaborators.history.readiness();
        match tokio::time::timeout(settings.ready_timeout, ready.wait_for(|r| *r)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => {
                return Err(SessionError::NotReady {
                    stage: "history provider",
                    timeout: settings.ready_timeout,
                });
            }
        }
        self.transition(SessionState::Ready);

        // Start buffering before the request goes out so nothing between the
        // history cutoff and the seam is lost.
        buffer.start();
        let ticks = self
            .collaborators
            .feed
            .subscribe(&settings.instrument)
            .map_err(|e| SessionError::Feed(e.to_string()))?;
        *pump.lock() = Some(tokio::spawn(pump_ticks(
            ticks,
            bridge.clone(),
            buffer.clone(),
            self.feed_closed.clone(),
        )));

        self.transition(SessionState::AwaitingHistorical);
        let request = HistoryRequest::new(
            settings.instrument.clone(),
            settings.timeframe,
            settings.date_from,
            settings.date_to,
            settings.count,
        );
        let batch = HistoryLoader::new(self.collaborators.history.clone())
            .request(&request, settings.history_timeout)
            .await?;

        collection.ingest_historical(batch.bars)?;
        bridge.attach(collection.clone(), buffer, batch.seam)?;
        self.transition(SessionState::Streaming);

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn await_login(&self) -> Result<(), SessionError> {
        let timeout = self.settings.login_timeout;
        let mut status = self.collaborators.session.login();
        let settled = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, SessionStatus::Connected | SessionStatus::Failed(_))),
        )
        .await;

        // `wait_for` only settles on `Connected` or `Failed`.
        let failure = match settled {
            Err(_) => {
                return Err(SessionError::NotReady {
                    stage: "login",
                    timeout,
                })
            }
            Ok(Err(_)) => Some("session closed".to_string()),
            Ok(Ok(status)) => match &*status {
                SessionStatus::Failed(reason) => Some(reason.clone()),
                _ => None,
            },
        };

        match failure {
            Some(reason) => Err(SessionError::LoginFailed(reason)),
            None => {
                info!(instrument = %self.settings.instrument, "logged in");
                Ok(())
            }
        }
    }
}

/// Route every raw tick through the bridge until the feed closes.
async fn pump_ticks(
    mut ticks: mpsc::Receiver<Tick>,
    bridge: Arc<LiveBridge>,
    buffer: Arc<TickBuffer>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(tick) = ticks.recv().await {
        bridge.route(tick, &buffer);
    }
    warn!(
        forwarded = bridge.forwarded(),
        "price feed disconnected; bars stay at their last state"
    );
    closed.send_replace(true);
}
