// =============================================================================
// Simulated market — in-process stand-in for session, feed and history
// =============================================================================
//
// Two modes:
//   * scripted:  fixed bars and tick lists, optional login/history faults.
//                 Used by tests to drive exact seam scenarios.
//   * generated: random-walk history ending in the current (open) bucket and
//                 a random-walk tick stream. Used by the demo binary.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::{
    HistoryProvider, HistoryRequest, HistoryResponse, MarketSession, PriceFeed, SessionStatus,
    MAX_BARS_PER_REQUEST,
};
use crate::timeframe::Timeframe;
use crate::types::{Bar, Tick};

const FEED_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, PartialEq)]
pub enum LoginBehaviour {
    Succeed,
    Fail(String),
    /// Stay in `Connecting` forever.
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryBehaviour {
    Respond,
    Fail(String),
    Cancel,
    /// Never answer.
    Silent,
}

/// Fixed behaviour for tests.
#[derive(Debug, Clone)]
pub struct SimulationScript {
    pub login: LoginBehaviour,
    pub history_ready: bool,
    pub history: HistoryBehaviour,
    pub bars: Vec<Bar>,
    /// Volume reported for the last bar; the last bar's timestamp is the seam.
    pub last_bar_volume: f64,
    pub history_delay: Duration,
    /// Delivered as soon as the feed is subscribed, i.e. while the history
    /// request is in flight.
    pub ticks_during_request: Vec<Tick>,
    /// Delivered after the history response has been sent.
    pub ticks_after_response: Vec<Tick>,
    /// Close the feed once every scripted tick has been sent.
    pub close_feed_when_done: bool,
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self {
            login: LoginBehaviour::Succeed,
            history_ready: true,
            history: HistoryBehaviour::Respond,
            bars: Vec::new(),
            last_bar_volume: 0.0,
            history_delay: Duration::from_millis(10),
            ticks_during_request: Vec::new(),
            ticks_after_response: Vec::new(),
            close_feed_when_done: true,
        }
    }
}

/// Random-walk parameters for the demo binary.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub start_price: f64,
    pub spread: f64,
    /// Largest single-tick move.
    pub step: f64,
    pub tick_interval: Duration,
    pub history_bars: usize,
}

enum Mode {
    Scripted(SimulationScript),
    Generated(GeneratorSettings),
}

struct Inner {
    mode: Mode,
    status: watch::Sender<SessionStatus>,
    ready: watch::Sender<bool>,
    feed: Mutex<Option<mpsc::Sender<Tick>>>,
    /// Held so silent requests never resolve.
    parked: Mutex<Vec<oneshot::Sender<HistoryResponse>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_seq: AtomicU64,
    last_price: Mutex<f64>,
    logouts: AtomicU64,
}

/// Implements [`MarketSession`], [`PriceFeed`] and [`HistoryProvider`].
#[derive(Clone)]
pub struct SimulatedMarket {
    inner: Arc<Inner>,
}

impl SimulatedMarket {
    pub fn scripted(script: SimulationScript) -> Self {
        Self::with_mode(Mode::Scripted(script), 0.0)
    }

    pub fn generated(settings: GeneratorSettings) -> Self {
        let start = settings.start_price;
        Self::with_mode(Mode::Generated(settings), start)
    }

    fn with_mode(mode: Mode, start_price: f64) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                mode,
                status,
                ready,
                feed: Mutex::new(None),
                parked: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                next_seq: AtomicU64::new(1),
                last_price: Mutex::new(start_price),
                logouts: AtomicU64::new(0),
            }),
        }
    }

    /// How many times `logout` was called.
    pub fn logouts(&self) -> u64 {
        self.inner.logouts.load(Ordering::Relaxed)
    }

    /// Whether the feed sender is still open.
    pub fn feed_open(&self) -> bool {
        self.inner.feed.lock().is_some()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner.tasks.lock().push(handle);
    }
}

impl MarketSession for SimulatedMarket {
    fn login(&self) -> watch::Receiver<SessionStatus> {
        let rx = self.inner.status.subscribe();
        self.inner.status.send_replace(SessionStatus::Connecting);

        let (outcome, ready) = match &self.inner.mode {
            Mode::Scripted(script) => (script.login.clone(), script.history_ready),
            Mode::Generated(_) => (LoginBehaviour::Succeed, true),
        };
        match outcome {
            LoginBehaviour::Succeed => {
                self.inner.status.send_replace(SessionStatus::Connected);
                self.inner.ready.send_replace(ready);
                info!("simulated session connected");
            }
            LoginBehaviour::Fail(reason) => {
                self.inner.status.send_replace(SessionStatus::Failed(reason));
            }
            LoginBehaviour::Hang => debug!("simulated login left hanging"),
        }
        rx
    }

    fn logout(&self) {
        self.inner.logouts.fetch_add(1, Ordering::Relaxed);
        self.inner.status.send_replace(SessionStatus::Disconnecting);
        self.inner.ready.send_replace(false);
        self.inner.feed.lock().take();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.status.send_replace(SessionStatus::Disconnected);
        info!("simulated session logged out");
    }
}

impl PriceFeed for SimulatedMarket {
    fn subscribe(&self, instrument: &str) -> anyhow::Result<mpsc::Receiver<Tick>> {
        if *self.inner.status.borrow() != SessionStatus::Connected {
            anyhow::bail!("cannot subscribe to {instrument}: session is not connected");
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);

        match &self.inner.mode {
            Mode::Scripted(script) => {
                for tick in &script.ticks_during_request {
                    if tx.try_send(tick.clone()).is_err() {
                        warn!(seq = tick.seq, "scripted tick did not fit the feed channel");
                    }
                }
            }
            Mode::Generated(settings) => {
                let inner = self.inner.clone();
                let settings = settings.clone();
                let feed = tx.clone();
                self.track(tokio::spawn(async move {
                    generate_ticks(inner, settings, feed).await;
                }));
            }
        }

        *self.inner.feed.lock() = Some(tx);
        info!(instrument, "simulated feed subscribed");
        Ok(rx)
    }
}

impl HistoryProvider for SimulatedMarket {
    fn readiness(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    fn send_request(&self, request: HistoryRequest) -> oneshot::Receiver<HistoryResponse> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();

        match &self.inner.mode {
            Mode::Scripted(script) => {
                if script.history == HistoryBehaviour::Silent {
                    self.inner.parked.lock().push(tx);
                    return rx;
                }
                let script = script.clone();
                self.track(tokio::spawn(async move {
                    tokio::time::sleep(script.history_delay).await;
                    let response = match &script.history {
                        HistoryBehaviour::Fail(reason) => HistoryResponse::Failed(reason.clone()),
                        HistoryBehaviour::Cancel => HistoryResponse::Cancelled,
                        _ => HistoryResponse::Completed {
                            last_bar_time: script.bars.last().map(|b| b.timestamp),
                            last_bar_volume: script.last_bar_volume,
                            bars: script.bars.clone(),
                        },
                    };
                    let _ = tx.send(response);

                    let feed = inner.feed.lock().clone();
                    if let Some(feed) = feed {
                        for tick in script.ticks_after_response {
                            if feed.send(tick).await.is_err() {
                                break;
                            }
                        }
                    }
                    if script.close_feed_when_done {
                        inner.feed.lock().take();
                        debug!("simulated feed closed after script");
                    }
                }));
            }
            Mode::Generated(settings) => {
                let settings = settings.clone();
                self.track(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let bars = generate_history(&inner, &settings, &request, Utc::now());
                    let last_bar_volume = bars.last().map_or(0.0, |b| b.volume);
                    let _ = tx.send(HistoryResponse::Completed {
                        last_bar_time: bars.last().map(|b| b.timestamp),
                        last_bar_volume,
                        bars,
                    });
                }));
            }
        }
        rx
    }
}

/// Random-walk bars for `request`, oldest first, the last one being the
/// bucket that contains `now` (or `request.to` when earlier). At most
/// [`MAX_BARS_PER_REQUEST`] bars are produced.
fn generate_history(
    inner: &Inner,
    settings: &GeneratorSettings,
    request: &HistoryRequest,
    now: DateTime<Utc>,
) -> Vec<Bar> {
    let count = request
        .max_count
        .map_or(settings.history_bars, |c| c.min(MAX_BARS_PER_REQUEST) as usize)
        .clamp(1, MAX_BARS_PER_REQUEST as usize);
    let end = request.to.map_or(now, |to| to.min(now));
    let buckets = trailing_buckets(request.timeframe, end, count);

    let mut rng = StdRng::from_entropy();
    let mut price = settings.start_price;
    let mut bars = Vec::with_capacity(buckets.len());
    for timestamp in buckets {
        if request.from.is_some_and(|from| timestamp < request.timeframe.bucket_start(from)) {
            continue;
        }
        let open = price;
        let mut high = open;
        let mut low = open;
        for _ in 0..4 {
            price += rng.gen_range(-settings.step..=settings.step);
            high = high.max(price);
            low = low.min(price);
        }
        bars.push(Bar {
            timestamp,
            bid_open: open,
            bid_high: high,
            bid_low: low,
            bid_close: price,
            ask_open: open + settings.spread,
            ask_high: high + settings.spread,
            ask_low: low + settings.spread,
            ask_close: price + settings.spread,
            volume: f64::from(rng.gen_range(10u32..200)),
        });
    }
    *inner.last_price.lock() = price;
    bars
}

/// Bucket starts of the `count` buckets ending with the one containing `now`.
fn trailing_buckets(timeframe: Timeframe, now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let mut buckets = Vec::with_capacity(count);
    let mut current = timeframe.bucket_start(now);
    for _ in 0..count {
        buckets.push(current);
        current = timeframe.bucket_start(current - chrono::Duration::seconds(1));
    }
    buckets.reverse();
    buckets
}

async fn generate_ticks(inner: Arc<Inner>, settings: GeneratorSettings, feed: mpsc::Sender<Tick>) {
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(settings.tick_interval);
    loop {
        interval.tick().await;
        let tick = {
            let mut last = inner.last_price.lock();
            *last += rng.gen_range(-settings.step..=settings.step);
            Tick {
                seq: inner.next_seq.fetch_add(1, Ordering::Relaxed),
                timestamp: Utc::now(),
                bid: *last,
                ask: *last + settings.spread,
                volume: f64::from(rng.gen_range(1u32..=5)),
            }
        };
        if feed.send(tick).await.is_err() {
            debug!("tick generator stopped: feed receiver dropped");
            return;
        }
    }
}
