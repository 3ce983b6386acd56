// =============================================================================
// Period Collection — historical bars + buffered ticks + live ticks
// =============================================================================
//
// One instance per (instrument, timeframe). Lifecycle:
//   1. `ingest_historical` appends provider bars as closed.
//   2. `finish` closes the seam: reopens the provider's in-progress last bar
//      (volume reset to the seam baseline) and replays the buffered ticks.
//   3. `on_tick` folds live ticks until the caller detaches.
//
// Every tick, buffered or live, goes through the same fold so the final bars
// do not depend on which side of the seam a tick arrived on. Ticks carry the
// feed sequence number; anything at or below the last seen sequence is a
// duplicate and is ignored.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::PeriodError;
use crate::timeframe::Timeframe;
use crate::types::{Bar, PeriodSnapshot, SeamMarker, Tick};

/// Capacity of the change-event channel. Slow observers lag rather than
/// block the aggregator.
const EVENT_CAPACITY: usize = 1_024;

/// Change notifications for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PeriodEvent {
    /// The open bar changed (new or extended).
    Updated(Bar),
    /// A bar was closed and is now immutable.
    Closed(Bar),
}

/// What happened to a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Folded into the current open bar.
    Extended,
    /// Started a new bucket (closing the previous open bar, if any).
    Opened,
    /// Older than the open bucket, inside a closed bucket, or before the
    /// seam. Dropped.
    Stale,
    /// Sequence number already seen. Dropped.
    Duplicate,
}

/// Summary of a `finish` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishReport {
    /// The last historical bar was reopened as the open bar.
    pub reopened: bool,
    /// Buffered ticks folded into bars.
    pub replayed: usize,
    /// Buffered ticks already represented by history, stale, or duplicated.
    pub discarded: usize,
}

#[derive(Default)]
struct PeriodState {
    closed: Vec<Bar>,
    open: Option<Bar>,
    finished: bool,
    seam: Option<SeamMarker>,
    last_seq: Option<u64>,
}

/// Thread-safe bar aggregator. Writers serialize on the lock; `snapshot`
/// readers run concurrently.
pub struct PeriodCollection {
    instrument: String,
    timeframe: Timeframe,
    state: RwLock<PeriodState>,
    events: broadcast::Sender<PeriodEvent>,
}

impl PeriodCollection {
    pub fn new(instrument: impl Into<String>, timeframe: Timeframe) -> Result<Self, PeriodError> {
        timeframe.ensure_bars()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            instrument: instrument.into(),
            timeframe,
            state: RwLock::new(PeriodState::default()),
            events,
        })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Receive `PeriodEvent`s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeriodEvent> {
        self.events.subscribe()
    }

    /// Append provider bars as closed, in the given order.
    ///
    /// The batch is checked before anything is appended, so a failure leaves
    /// the collection unchanged.
    pub fn ingest_historical(
        &self,
        bars: impl IntoIterator<Item = Bar>,
    ) -> Result<usize, PeriodError> {
        let bars: Vec<Bar> = bars.into_iter().collect();
        let mut state = self.state.write();
        if state.finished {
            return Err(PeriodError::HistoryAfterSeam);
        }

        let mut previous = state.closed.last().map(|b| b.timestamp);
        for bar in &bars {
            if let Some(prev) = previous {
                if bar.timestamp <= prev {
                    return Err(PeriodError::OutOfOrderHistoricalBar {
                        previous: prev,
                        got: bar.timestamp,
                    });
                }
            }
            previous = Some(bar.timestamp);
        }

        let count = bars.len();
        state.closed.extend(bars);
        debug!(
            instrument = %self.instrument,
            timeframe = %self.timeframe,
            count,
            total = state.closed.len(),
            "historical bars ingested"
        );
        Ok(count)
    }

    /// Close the seam and replay the ticks buffered during the history
    /// request.
    ///
    /// When the last historical bar starts at `seam.timestamp` it is the
    /// provider's in-progress bar: it becomes the open bar with its volume
    /// reset to `seam.volume`, and buffered ticks in the same bucket continue
    /// it. Ticks older than the seam are already in history and are dropped.
    ///
    /// Repeating the call with the same seam only folds `buffered` through the
    /// live path (duplicates are ignored); a different seam is an error.
    pub fn finish(
        &self,
        seam: Option<SeamMarker>,
        buffered: Vec<Tick>,
    ) -> Result<FinishReport, PeriodError> {
        let mut state = self.state.write();
        let mut report = FinishReport::default();

        if state.finished {
            if state.seam != seam {
                return Err(PeriodError::SeamMismatch {
                    existing: state.seam.map(|s| s.timestamp),
                    requested: seam.map(|s| s.timestamp),
                });
            }
        } else {
            if let Some(marker) = seam {
                let seam_bucket = self.timeframe.bucket_start(marker.timestamp);
                if state.closed.last().map(|b| b.timestamp) == Some(seam_bucket) {
                    if let Some(mut last) = state.closed.pop() {
                        last.volume = marker.volume;
                        let _ = self.events.send(PeriodEvent::Updated(last.clone()));
                        state.open = Some(last);
                        report.reopened = true;
                    }
                }
            }
            state.finished = true;
            state.seam = seam;
        }

        for tick in &buffered {
            match self.fold(&mut state, tick) {
                TickOutcome::Extended | TickOutcome::Opened => report.replayed += 1,
                TickOutcome::Stale | TickOutcome::Duplicate => report.discarded += 1,
            }
        }

        info!(
            instrument = %self.instrument,
            timeframe = %self.timeframe,
            seam = ?seam.map(|s| s.timestamp),
            reopened = report.reopened,
            replayed = report.replayed,
            discarded = report.discarded,
            closed = state.closed.len(),
            "seam closed"
        );
        Ok(report)
    }

    /// Fold one live tick. Only valid after `finish`.
    pub fn on_tick(&self, tick: &Tick) -> Result<TickOutcome, PeriodError> {
        let mut state = self.state.write();
        if !state.finished {
            return Err(PeriodError::NotReady);
        }
        Ok(self.fold(&mut state, tick))
    }

    fn fold(&self, state: &mut PeriodState, tick: &Tick) -> TickOutcome {
        if state.last_seq.is_some_and(|last| tick.seq <= last) {
            debug!(seq = tick.seq, "duplicate tick ignored");
            return TickOutcome::Duplicate;
        }
        state.last_seq = Some(tick.seq);

        if state.seam.is_some_and(|s| tick.timestamp < s.timestamp) {
            return TickOutcome::Stale;
        }

        let bucket = self.timeframe.bucket_start(tick.timestamp);

        if let Some(open) = state.open.as_mut() {
            if bucket == open.timestamp {
                open.extend_prices(tick);
                open.volume += tick.volume;
                let _ = self.events.send(PeriodEvent::Updated(open.clone()));
                return TickOutcome::Extended;
            }
            if bucket < open.timestamp {
                warn!(
                    seq = tick.seq,
                    tick_time = %tick.timestamp,
                    open_bar = %open.timestamp,
                    "stale tick discarded"
                );
                return TickOutcome::Stale;
            }
        } else if state.closed.last().is_some_and(|b| bucket <= b.timestamp) {
            debug!(seq = tick.seq, tick_time = %tick.timestamp, "tick falls in a closed bar");
            return TickOutcome::Stale;
        }

        if let Some(done) = state.open.take() {
            debug!(instrument = %self.instrument, bar = %done.timestamp, volume = done.volume, "bar closed");
            let _ = self.events.send(PeriodEvent::Closed(done.clone()));
            state.closed.push(done);
        }
        let bar = Bar::from_tick(bucket, tick);
        let _ = self.events.send(PeriodEvent::Updated(bar.clone()));
        state.open = Some(bar);
        TickOutcome::Opened
    }

    /// Copy of the closed bars plus the open bar.
    pub fn snapshot(&self) -> PeriodSnapshot {
        let state = self.state.read();
        PeriodSnapshot {
            instrument: self.instrument.clone(),
            timeframe: self.timeframe.to_string(),
            closed: state.closed.clone(),
            open: state.open.clone(),
        }
    }

    pub fn open_bar(&self) -> Option<Bar> {
        self.state.read().open.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.read().finished
    }

    /// Closed bars plus the open one.
    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.closed.len() + usize::from(state.open.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open time of the newest bar, open or closed.
    pub fn latest_bucket(&self) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        state
            .open
            .as_ref()
            .or(state.closed.last())
            .map(|b| b.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
    }

    fn bar(ts: DateTime<Utc>, price: f64, volume: f64) -> Bar {
        Bar {
            timestamp: ts,
            bid_open: price,
            bid_high: price + 0.001,
            bid_low: price - 0.001,
            bid_close: price,
            ask_open: price + 0.0002,
            ask_high: price + 0.0012,
            ask_low: price - 0.0008,
            ask_close: price + 0.0002,
            volume,
        }
    }

    fn tick(seq: u64, ts: DateTime<Utc>, bid: f64, volume: f64) -> Tick {
        Tick {
            seq,
            timestamp: ts,
            bid,
            ask: bid + 0.0002,
            volume,
        }
    }

    fn collection() -> PeriodCollection {
        PeriodCollection::new("EUR/USD", Timeframe::minutes(1)).unwrap()
    }

    fn history() -> Vec<Bar> {
        vec![bar(at(9, 0, 0), 1.1000, 7.0), bar(at(9, 1, 0), 1.1010, 5.0)]
    }

    fn seam() -> Option<SeamMarker> {
        Some(SeamMarker {
            timestamp: at(9, 1, 0),
            volume: 5.0,
        })
    }

    fn straddling_ticks() -> Vec<Tick> {
        vec![
            tick(1, at(9, 0, 59), 1.0990, 9.0),
            tick(2, at(9, 1, 10), 1.1020, 2.0),
            tick(3, at(9, 1, 40), 1.1005, 3.0),
            tick(4, at(9, 2, 5), 1.1030, 4.0),
            tick(5, at(9, 2, 30), 1.1040, 1.0),
            tick(6, at(9, 3, 0), 1.1035, 6.0),
        ]
    }

    fn assert_invariants(snap: &PeriodSnapshot) {
        let all: Vec<&Bar> = snap.bars().collect();
        assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        if let (Some(open), Some(last)) = (&snap.open, snap.closed.last()) {
            assert!(open.timestamp > last.timestamp);
        }
    }

    #[test]
    fn tick_timeframe_is_rejected() {
        let tf: Timeframe = "t1".parse().unwrap();
        assert!(matches!(
            PeriodCollection::new("EUR/USD", tf),
            Err(PeriodError::InvalidTimeframe(_))
        ));
    }

    #[test]
    fn worked_scenario_across_the_seam() {
        let periods = collection();
        periods.ingest_historical(history()).unwrap();

        let buffered = vec![
            tick(1, at(9, 1, 10), 1.1050, 2.0),
            tick(2, at(9, 1, 40), 1.1005, 3.0),
            tick(3, at(9, 2, 5), 1.1030, 4.0),
        ];
        let report = periods.finish(seam(), buffered).unwrap();
        assert!(report.reopened);
        assert_eq!(report.replayed, 3);

        let snap = periods.snapshot();
        assert_eq!(snap.closed.len(), 2);
        assert!((snap.closed[1].volume - 10.0).abs() < f64::EPSILON);
        assert!((snap.closed[1].bid_high - 1.1050).abs() < f64::EPSILON);
        assert!((snap.closed[1].bid_close - 1.1005).abs() < f64::EPSILON);
        let open = snap.open.unwrap();
        assert_eq!(open.timestamp, at(9, 2, 0));
        assert!((open.volume - 4.0).abs() < f64::EPSILON);

        assert_eq!(
            periods.on_tick(&tick(4, at(9, 2, 30), 1.1040, 1.0)).unwrap(),
            TickOutcome::Extended
        );
        let open = periods.open_bar().unwrap();
        assert_eq!(open.timestamp, at(9, 2, 0));
        assert!((open.volume - 5.0).abs() < f64::EPSILON);

        assert_eq!(
            periods.on_tick(&tick(5, at(9, 3, 0), 1.1035, 1.0)).unwrap(),
            TickOutcome::Opened
        );
        let snap = periods.snapshot();
        assert_eq!(snap.closed.len(), 3);
        assert_eq!(snap.closed[2].timestamp, at(9, 2, 0));
        assert_eq!(snap.open.unwrap().timestamp, at(9, 3, 0));
    }

    #[test]
    fn seam_split_point_does_not_change_result() {
        let ticks = straddling_ticks();
        let mut results = Vec::new();

        for split in 0..=ticks.len() {
            let periods = collection();
            periods.ingest_historical(history()).unwrap();
            periods.finish(seam(), ticks[..split].to_vec()).unwrap();
            for t in &ticks[split..] {
                periods.on_tick(t).unwrap();
            }
            let snap = periods.snapshot();
            assert_invariants(&snap);
            results.push(snap);
        }

        assert!(results.windows(2).all(|w| w[0] == w[1]));
        // The 09:00:59 tick is older than the seam and never counted.
        assert!((results[0].closed[0].volume - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overlapping_delivery_is_not_double_counted() {
        let periods = collection();
        periods.ingest_historical(history()).unwrap();
        let ticks = straddling_ticks();
        periods.finish(seam(), ticks[..4].to_vec()).unwrap();

        // Feed replays the tail of the buffer before continuing.
        for t in &ticks[2..] {
            periods.on_tick(t).unwrap();
        }

        let reference = collection();
        reference.ingest_historical(history()).unwrap();
        reference.finish(seam(), ticks.clone()).unwrap();

        assert_eq!(periods.snapshot(), reference.snapshot());
        assert!((periods.snapshot().closed[1].volume - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_tick_reports_duplicate() {
        let periods = collection();
        periods.finish(None, Vec::new()).unwrap();
        let t = tick(1, at(9, 0, 1), 1.1, 1.0);
        assert_eq!(periods.on_tick(&t).unwrap(), TickOutcome::Opened);
        assert_eq!(periods.on_tick(&t).unwrap(), TickOutcome::Duplicate);
        assert!((periods.open_bar().unwrap().volume - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn finish_twice_with_same_seam_is_idempotent() {
        let buffered = straddling_ticks()[..4].to_vec();

        let once = collection();
        once.ingest_historical(history()).unwrap();
        once.finish(seam(), buffered.clone()).unwrap();

        let twice = collection();
        twice.ingest_historical(history()).unwrap();
        twice.finish(seam(), buffered.clone()).unwrap();
        let again = twice.finish(seam(), buffered).unwrap();
        assert!(!again.reopened);
        assert_eq!(again.replayed, 0);

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn finish_with_different_seam_fails() {
        let periods = collection();
        periods.ingest_historical(history()).unwrap();
        periods.finish(seam(), Vec::new()).unwrap();
        let other = Some(SeamMarker {
            timestamp: at(9, 0, 0),
            volume: 1.0,
        });
        assert!(matches!(
            periods.finish(other, Vec::new()),
            Err(PeriodError::SeamMismatch { .. })
        ));
    }

    #[test]
    fn out_of_order_history_is_rejected_without_partial_append() {
        let periods = collection();
        let bad = vec![
            bar(at(9, 0, 0), 1.1, 1.0),
            bar(at(9, 2, 0), 1.1, 1.0),
            bar(at(9, 1, 0), 1.1, 1.0),
        ];
        let err = periods.ingest_historical(bad).unwrap_err();
        assert_eq!(
            err,
            PeriodError::OutOfOrderHistoricalBar {
                previous: at(9, 2, 0),
                got: at(9, 1, 0),
            }
        );
        assert!(periods.is_empty());

        periods.ingest_historical(history()).unwrap();
        let dup = vec![bar(at(9, 1, 0), 1.1, 1.0)];
        assert!(periods.ingest_historical(dup).is_err());
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let periods = collection();
        let t = tick(1, at(9, 0, 1), 1.1, 1.0);
        assert_eq!(periods.on_tick(&t), Err(PeriodError::NotReady));

        periods.finish(None, Vec::new()).unwrap();
        assert_eq!(
            periods.ingest_historical(history()),
            Err(PeriodError::HistoryAfterSeam)
        );
    }

    #[test]
    fn stale_tick_does_not_touch_closed_bars() {
        let periods = collection();
        periods.ingest_historical(history()).unwrap();
        periods.finish(seam(), Vec::new()).unwrap();
        periods.on_tick(&tick(1, at(9, 2, 10), 1.2, 1.0)).unwrap();

        let before = periods.snapshot();
        assert_eq!(
            periods.on_tick(&tick(2, at(9, 1, 50), 1.5, 100.0)).unwrap(),
            TickOutcome::Stale
        );
        assert_eq!(periods.snapshot(), before);
    }

    #[test]
    fn complete_last_bar_stays_closed() {
        let periods = collection();
        periods.ingest_historical(history()).unwrap();
        // Seam points at an earlier bucket; the 09:01 bar is complete.
        let report = periods
            .finish(
                Some(SeamMarker {
                    timestamp: at(9, 0, 0),
                    volume: 7.0,
                }),
                vec![tick(1, at(9, 1, 30), 1.3, 4.0), tick(2, at(9, 2, 0), 1.2, 1.0)],
            )
            .unwrap();
        assert!(!report.reopened);
        assert_eq!(report.discarded, 1);

        let snap = periods.snapshot();
        assert!((snap.closed[1].volume - 5.0).abs() < f64::EPSILON);
        assert_eq!(snap.open.unwrap().timestamp, at(9, 2, 0));
    }

    #[test]
    fn empty_history_starts_from_first_tick() {
        let periods = collection();
        periods.ingest_historical(Vec::new()).unwrap();
        periods
            .finish(None, vec![tick(1, at(9, 0, 5), 1.1, 1.0)])
            .unwrap();
        periods.on_tick(&tick(2, at(9, 0, 40), 1.0, 2.0)).unwrap();

        let open = periods.open_bar().unwrap();
        assert_eq!(open.timestamp, at(9, 0, 0));
        assert!((open.bid_low - 1.0).abs() < f64::EPSILON);
        assert!((open.bid_open - 1.1).abs() < f64::EPSILON);
        assert!((open.volume - 3.0).abs() < f64::EPSILON);
        assert_eq!(periods.latest_bucket(), Some(at(9, 0, 0)));
    }

    #[test]
    fn events_report_updates_and_closes() {
        let periods = collection();
        let mut rx = periods.subscribe();
        periods.finish(None, Vec::new()).unwrap();
        periods.on_tick(&tick(1, at(9, 0, 5), 1.1, 1.0)).unwrap();
        periods.on_tick(&tick(2, at(9, 1, 5), 1.2, 1.0)).unwrap();

        assert!(matches!(rx.try_recv().unwrap(), PeriodEvent::Updated(b) if b.timestamp == at(9, 0, 0)));
        assert!(matches!(rx.try_recv().unwrap(), PeriodEvent::Closed(b) if b.timestamp == at(9, 0, 0)));
        assert!(matches!(rx.try_recv().unwrap(), PeriodEvent::Updated(b) if b.timestamp == at(9, 1, 0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reopened_seam_bar_is_announced() {
        let periods = collection();
        let mut rx = periods.subscribe();
        periods.ingest_historical(history()).unwrap();
        let report = periods.finish(seam(), Vec::new()).unwrap();
        assert!(report.reopened);

        match rx.try_recv().unwrap() {
            PeriodEvent::Updated(bar) => {
                assert_eq!(bar.timestamp, at(9, 1, 0));
                assert!((bar.volume - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        let periods = Arc::new(collection());
        periods.finish(None, Vec::new()).unwrap();

        let writer = {
            let periods = periods.clone();
            std::thread::spawn(move || {
                for seq in 1..=600u64 {
                    let ts = at(9, 0, 0) + chrono::Duration::seconds(seq as i64);
                    periods.on_tick(&tick(seq, ts, 1.1, 1.0)).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let periods = periods.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        assert_invariants(&periods.snapshot());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        let snap = periods.snapshot();
        let total: f64 = snap.bars().map(|b| b.volume).sum();
        assert!((total - 600.0).abs() < f64::EPSILON);
        assert_eq!(snap.len(), 11);
    }
}
