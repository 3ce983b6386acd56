// =============================================================================
// Live Bridge — routes raw feed ticks across the seam
// =============================================================================
//
// Every raw tick enters through `route`. While no collection is attached the
// tick goes to the `TickBuffer`; once attached it is folded straight into the
// `PeriodCollection`; after `detach` it is dropped. Routing, the attach
// hand-off, and detach all take the same lock, so a tick is either drained
// by `attach` or forwarded after it, never both and never neither.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::PeriodError;
use crate::market_data::period_collection::{FinishReport, PeriodCollection};
use crate::market_data::tick_buffer::TickBuffer;
use crate::types::{SeamMarker, Tick};

#[derive(Default)]
enum Route {
    #[default]
    Buffering,
    Forwarding(Arc<PeriodCollection>),
    Detached,
}

/// Where a routed tick ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Buffered,
    Forwarded,
    Dropped,
}

#[derive(Default)]
pub struct LiveBridge {
    route: Mutex<Route>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl LiveBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one raw tick to whichever side of the seam is current.
    pub fn route(&self, tick: Tick, buffer: &TickBuffer) -> Routed {
        let route = self.route.lock();
        match &*route {
            Route::Buffering => {
                if buffer.push(tick) {
                    Routed::Buffered
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Routed::Dropped
                }
            }
            Route::Forwarding(collection) => match collection.on_tick(&tick) {
                Ok(_) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                    Routed::Forwarded
                }
                Err(e) => {
                    error!(seq = tick.seq, error = %e, "live tick rejected by period collection");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Routed::Dropped
                }
            },
            Route::Detached => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Routed::Dropped
            }
        }
    }

    /// Close the seam on `collection` with everything buffered so far, then
    /// forward all later ticks to it.
    pub fn attach(
        &self,
        collection: Arc<PeriodCollection>,
        buffer: &TickBuffer,
        seam: Option<SeamMarker>,
    ) -> Result<FinishReport, PeriodError> {
        let mut route = self.route.lock();
        if matches!(*route, Route::Detached) {
            debug!("attach after detach ignored");
            return Ok(FinishReport::default());
        }

        let buffered = buffer.drain();
        buffer.stop();
        let report = collection.finish(seam, buffered)?;
        info!(
            instrument = %collection.instrument(),
            replayed = report.replayed,
            discarded = report.discarded,
            "live bridge attached"
        );
        *route = Route::Forwarding(collection);
        Ok(report)
    }

    /// Stop forwarding. Idempotent and safe before `attach`.
    pub fn detach(&self) {
        let mut route = self.route.lock();
        if !matches!(*route, Route::Detached) {
            *route = Route::Detached;
            info!(
                forwarded = self.forwarded(),
                dropped = self.dropped(),
                "live bridge detached"
            );
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.route.lock(), Route::Forwarding(_))
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
