// =============================================================================
// Application Configuration — session parameters loaded from JSON + env
// =============================================================================
//
// Every field carries a serde default so a partial (or empty) file still
// loads. `LIVE_BARS_*` environment variables override the file, and
// `to_session_settings` is the single place where strings become typed
// session parameters.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::simulated::GeneratorSettings;
use crate::provider::MAX_BARS_PER_REQUEST;
use crate::session::SessionSettings;
use crate::timeframe::Timeframe;

/// Date format accepted for `date_from` / `date_to` (`MM.dd.yyyy HH:mm:ss`).
pub const DATE_FORMAT: &str = "%m.%d.%Y %H:%M:%S";

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_instrument() -> String {
    "EUR/USD".to_string()
}

fn default_timeframe() -> String {
    "m1".to_string()
}

fn default_count() -> i32 {
    -1
}

fn default_login_timeout_secs() -> u64 {
    30
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_history_timeout_secs() -> u64 {
    60
}

fn default_start_price() -> f64 {
    1.1000
}

fn default_spread() -> f64 {
    0.0002
}

fn default_step() -> f64 {
    0.0003
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_history_bars() -> usize {
    30
}

// =============================================================================
// SimulationConfig
// =============================================================================

/// Parameters for the built-in simulated market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Mid price the random walk starts from.
    #[serde(default = "default_start_price")]
    pub start_price: f64,

    /// Ask minus bid.
    #[serde(default = "default_spread")]
    pub spread: f64,

    /// Largest single-tick move of the mid price.
    #[serde(default = "default_step")]
    pub step: f64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Bars served when the request carries no count.
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_price: default_start_price(),
            spread: default_spread(),
            step: default_step(),
            tick_interval_ms: default_tick_interval_ms(),
            history_bars: default_history_bars(),
        }
    }
}

impl SimulationConfig {
    pub fn generator_settings(&self) -> GeneratorSettings {
        GeneratorSettings {
            start_price: self.start_price,
            spread: self.spread,
            step: self.step,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            history_bars: self.history_bars,
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Instrument symbol, e.g. `EUR/USD`.
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// Timeframe code such as `m1`, `H1`, `D1`. Tick timeframes are refused.
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Start of the history window. Empty = unbounded.
    #[serde(default)]
    pub date_from: String,

    /// End of the history window. Empty = up to now.
    #[serde(default)]
    pub date_to: String,

    /// Maximum bars to request. Non-positive = provider default.
    #[serde(default = "default_count")]
    pub count: i32,

    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            timeframe: default_timeframe(),
            date_from: String::new(),
            date_to: String::new(),
            count: default_count(),
            login_timeout_secs: default_login_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            history_timeout_secs: default_history_timeout_secs(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instrument = %config.instrument,
            timeframe = %config.timeframe,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply `LIVE_BARS_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LIVE_BARS_INSTRUMENT") {
            self.instrument = v.trim().to_string();
        }
        if let Some(v) = lookup("LIVE_BARS_TIMEFRAME") {
            self.timeframe = v.trim().to_string();
        }
        if let Some(v) = lookup("LIVE_BARS_DATE_FROM") {
            self.date_from = v.trim().to_string();
        }
        if let Some(v) = lookup("LIVE_BARS_DATE_TO") {
            self.date_to = v.trim().to_string();
        }
        if let Some(v) = lookup("LIVE_BARS_COUNT") {
            match v.trim().parse() {
                Ok(count) => self.count = count,
                Err(e) => warn!(value = %v, error = %e, "ignoring LIVE_BARS_COUNT"),
            }
        }
        if let Some(v) = lookup("LIVE_BARS_HISTORY_TIMEOUT_SECS") {
            match v.trim().parse() {
                Ok(secs) => self.history_timeout_secs = secs,
                Err(e) => warn!(value = %v, error = %e, "ignoring LIVE_BARS_HISTORY_TIMEOUT_SECS"),
            }
        }
    }

    /// Check the configuration against the current clock.
    pub fn validate(&self) -> Result<()> {
        self.to_session_settings(Utc::now()).map(|_| ())
    }

    /// Build typed session parameters. `now` bounds `date_from`.
    pub fn to_session_settings(&self, now: DateTime<Utc>) -> Result<SessionSettings> {
        if self.instrument.trim().is_empty() {
            bail!("instrument must not be empty");
        }

        let timeframe: Timeframe = self
            .timeframe
            .parse()
            .with_context(|| format!("invalid timeframe {:?}", self.timeframe))?;
        timeframe
            .ensure_bars()
            .context("live bars need a bar timeframe")?;

        let date_from = parse_date(&self.date_from).context("invalid date_from")?;
        let date_to = parse_date(&self.date_to).context("invalid date_to")?;

        if let Some(from) = date_from {
            if from >= now {
                bail!("date_from {from} must be in the past");
            }
            if let Some(to) = date_to {
                if to <= from {
                    bail!("date_to {to} must be after date_from {from}");
                }
            }
        }

        if i64::from(self.count) > i64::from(MAX_BARS_PER_REQUEST) {
            bail!(
                "count {} exceeds the {} bars a request may ask for",
                self.count,
                MAX_BARS_PER_REQUEST
            );
        }

        for (name, secs) in [
            ("login_timeout_secs", self.login_timeout_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("history_timeout_secs", self.history_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be positive");
            }
        }

        Ok(SessionSettings {
            instrument: self.instrument.trim().to_string(),
            timeframe,
            date_from,
            date_to,
            count: self.count,
            login_timeout: Duration::from_secs(self.login_timeout_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            history_timeout: Duration::from_secs(self.history_timeout_secs),
        })
    }
}

/// Parse an `MM.dd.yyyy HH:mm:ss` string as UTC. Blank = `None`.
pub fn parse_date(raw: &str) -> Result<Option<DateTime<Utc>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let naive = NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .with_context(|| format!("expected MM.dd.yyyy HH:mm:ss, got {raw:?}"))?;
    Ok(Some(naive.and_utc()))
}
