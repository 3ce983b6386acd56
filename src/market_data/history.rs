// =============================================================================
// Historical Loader — one bounded request against the history provider
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::error::HistoryError;
use crate::provider::{HistoryProvider, HistoryRequest, HistoryResponse};
use crate::types::{Bar, SeamMarker};

/// Bars returned by the provider plus the seam they end on.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBatch {
    pub bars: Vec<Bar>,
    /// `None` when the provider returned no bars.
    pub seam: Option<SeamMarker>,
}

/// Issues history requests and waits for the answer with a bound.
pub struct HistoryLoader {
    provider: Arc<dyn HistoryProvider>,
}

impl HistoryLoader {
    pub fn new(provider: Arc<dyn HistoryProvider>) -> Self {
        Self { provider }
    }

    /// Send `request` and wait up to `timeout` for the response.
    ///
    /// Nothing is sent for tick-level timeframes.
    #[instrument(skip(self, request), fields(id = %request.id, instrument = %request.instrument, timeframe = %request.timeframe))]
    pub async fn request(
        &self,
        request: &HistoryRequest,
        timeout: Duration,
    ) -> Result<HistoricalBatch, HistoryError> {
        request.timeframe.ensure_bars()?;

        info!(
            from = ?request.from,
            to = ?request.to,
            max_count = ?request.max_count,
            "sending history request"
        );
        let response = self.provider.send_request(request.clone());

        let answer = match tokio::time::timeout(timeout, response).await {
            Err(_) => {
                warn!(?timeout, "history request timed out");
                return Err(HistoryError::RequestTimeout(timeout));
            }
            Ok(Err(_)) => {
                return Err(HistoryError::RequestRejected(
                    "provider dropped the request".into(),
                ));
            }
            Ok(Ok(answer)) => answer,
        };

        match answer {
            HistoryResponse::Completed {
                bars,
                last_bar_time,
                last_bar_volume,
            } => {
                let seam = last_bar_time.map(|timestamp| SeamMarker {
                    timestamp,
                    volume: last_bar_volume,
                });
                info!(count = bars.len(), seam = ?seam, "history received");
                Ok(HistoricalBatch { bars, seam })
            }
            HistoryResponse::Failed(reason) => {
                warn!(reason = %reason, "history request failed");
                Err(HistoryError::RequestRejected(reason))
            }
            HistoryResponse::Cancelled => {
                warn!("history request cancelled by provider");
                Err(HistoryError::RequestRejected("cancelled".into()))
            }
        }
    }
}
