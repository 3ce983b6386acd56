// =============================================================================
// Live Bars — Main Entry Point
// =============================================================================
//
// Loads history for one instrument/timeframe from the simulated market,
// joins it with the live feed at the seam and keeps the bars current until
// Ctrl+C.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use live_bars::config::AppConfig;
use live_bars::market_data::UpdateObserver;
use live_bars::provider::SimulatedMarket;
use live_bars::session::{Collaborators, LiveSession, SessionState};

const CONFIG_PATH: &str = "live_bars.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = AppConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    config.apply_env_overrides();

    let settings = config
        .to_session_settings(chrono::Utc::now())
        .context("invalid configuration")?;

    info!(
        instrument = %settings.instrument,
        timeframe = %settings.timeframe,
        date_from = ?settings.date_from,
        date_to = ?settings.date_to,
        count = settings.count,
        "Session parameters"
    );

    // ── 2. Collaborators ─────────────────────────────────────────────────
    let market = SimulatedMarket::generated(config.simulation.generator_settings());
    let collaborators = Collaborators {
        session: Arc::new(market.clone()),
        feed: Arc::new(market.clone()),
        history: Arc::new(market),
    };
    let session = Arc::new(LiveSession::new(settings, collaborators));

    // ── 3. Report bars as they change ────────────────────────────────────
    let reporter = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut state = session.state();
            if state
                .wait_for(|s| *s != SessionState::Disconnected)
                .await
                .is_err()
            {
                return;
            }
            let Some(collection) = session.collection() else {
                return;
            };
            let _observer = UpdateObserver::logging(&collection);

            if state
                .wait_for(|s| *s == SessionState::Streaming)
                .await
                .is_ok()
            {
                for bar in collection.snapshot().closed {
                    info!(
                        time = %bar.timestamp,
                        bid_open = bar.bid_open,
                        bid_high = bar.bid_high,
                        bid_low = bar.bid_low,
                        bid_close = bar.bid_close,
                        volume = bar.volume,
                        "historical bar"
                    );
                }
                info!("Streaming live updates, press Ctrl+C to stop");
            }
            // Keep the observer alive until the session ends.
            let _ = state
                .wait_for(|s| matches!(s, SessionState::Cancelled | SessionState::Disconnected))
                .await;
        })
    };

    // ── 4. Run until Ctrl+C ──────────────────────────────────────────────
    let result = session
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await;
    reporter.abort();

    match result {
        Ok(snapshot) => {
            info!(
                instrument = %snapshot.instrument,
                timeframe = %snapshot.timeframe,
                closed = snapshot.closed.len(),
                open = snapshot.open.is_some(),
                "Final bars"
            );
            if let Some(last) = snapshot.bars().last() {
                info!(
                    time = %last.timestamp,
                    bid_close = last.bid_close,
                    ask_close = last.ask_close,
                    volume = last.volume,
                    "Last bar"
                );
            }
            info!("Done!");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            Err(e.into())
        }
    }
}
