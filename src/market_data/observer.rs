// =============================================================================
// Update Observer — reports period collection changes
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::market_data::period_collection::{PeriodCollection, PeriodEvent};

/// Background task that hands every `PeriodEvent` to a callback until
/// `unsubscribe` is called or the collection is dropped.
pub struct UpdateObserver {
    handle: Option<JoinHandle<()>>,
}

impl UpdateObserver {
    /// Log every update with `tracing`.
    pub fn logging(collection: &Arc<PeriodCollection>) -> Self {
        let instrument = collection.instrument().to_string();
        Self::spawn(collection, move |event| match event {
            PeriodEvent::Updated(bar) => debug!(
                instrument = %instrument,
                time = %bar.timestamp,
                bid_close = bar.bid_close,
                ask_close = bar.ask_close,
                volume = bar.volume,
                "bar updated"
            ),
            PeriodEvent::Closed(bar) => info!(
                instrument = %instrument,
                time = %bar.timestamp,
                bid_open = bar.bid_open,
                bid_high = bar.bid_high,
                bid_low = bar.bid_low,
                bid_close = bar.bid_close,
                ask_open = bar.ask_open,
                ask_high = bar.ask_high,
                ask_low = bar.ask_low,
                ask_close = bar.ask_close,
                volume = bar.volume,
                "bar closed"
            ),
        })
    }

    pub fn spawn<F>(collection: &Arc<PeriodCollection>, mut on_event: F) -> Self
    where
        F: FnMut(&PeriodEvent) + Send + 'static,
    {
        let mut events = collection.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => on_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "update observer lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop observing. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("update observer unsubscribed");
        }
    }
}

impl Drop for UpdateObserver {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::timeframe::Timeframe;
    use crate::types::Tick;

    fn tick(seq: u64, minute: u32) -> Tick {
        Tick {
            seq,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 9, minute, 5).unwrap(),
            bid: 1.1,
            ask: 1.1002,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn observer_sees_updates_until_unsubscribed() {
        let collection =
            Arc::new(PeriodCollection::new("EUR/USD", Timeframe::minutes(1)).unwrap());
        collection.finish(None, Vec::new()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut observer = {
            let seen = seen.clone();
            UpdateObserver::spawn(&collection, move |event| {
                seen.lock().push(event.clone());
                let _ = done_tx.send(());
            })
        };

        collection.on_tick(&tick(1, 0)).unwrap();
        collection.on_tick(&tick(2, 1)).unwrap();
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }
        observer.unsubscribe();
        observer.unsubscribe();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], PeriodEvent::Closed(_)));

        collection.on_tick(&tick(3, 2)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(seen.lock().len(), 3);
    }
}
