//! Tracker configuration.
//!
//! [`TrackerConfig`] carries every tunable of the pipeline with defaults that
//! match the live MiWay feeds. [`CliArgs`] overlays command-line flags and
//! environment variables on top of those defaults.

use std::time::Duration;

use chrono_tz::Tz;
use clap::Parser;

use crate::error::ConfigError;
use crate::models::SourceTag;

pub const DEFAULT_POSITION_URL: &str = "https://www.miapp.ca/GTFS_RT/Vehicle/VehiclePositions.pb";
pub const DEFAULT_SNAPSHOT_URL: &str = "https://transit55.ca/mississauga/map/data.json";
pub const DEFAULT_PER_ROUTE_URL: &str = "https://www.transsee.ca/routeveh?a=miway&r={route}&refresh=30";
pub const DEFAULT_SHAPE_URL: &str = "https://transit55.ca/json/mississauga/map/trip_shape?id={id}";

pub const DEFAULT_POSITION_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PER_ROUTE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TRAIL_CAPACITY: usize = 100;
pub const DEFAULT_SHAPE_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TIMEZONE: &str = "America/Toronto";

/// Multiplier applied to the slowest enabled interval to get the freshness window.
const STALE_INTERVAL_FACTOR: u32 = 3;

/// Longest accepted polling interval, one day.
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Polling settings for one upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub enabled: bool,
    /// Endpoint URL. The per-route feed uses a `{route}` placeholder.
    pub url: String,
    pub interval: Duration,
}

impl SourceSettings {
    fn new(url: &str, interval_secs: u64) -> Self {
        Self {
            enabled: true,
            url: url.to_string(),
            interval: Duration::from_secs(interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub position: SourceSettings,
    pub snapshot: SourceSettings,
    pub per_route: SourceSettings,

    /// Route ids the per-route feed is queried for, one request each.
    pub routes: Vec<String>,

    /// Shape endpoint with an `{id}` placeholder.
    pub shape_url: String,

    /// Freshness window. `None` derives it from the enabled intervals.
    pub stale_after: Option<Duration>,

    /// How long a stale record (and its trail) is kept before being purged.
    pub purge_grace: Option<Duration>,

    pub trail_capacity: usize,
    pub shape_cache_capacity: usize,
    pub request_timeout: Duration,

    /// In-tick retries for transport failures.
    pub network_retries: u32,
    pub retry_delay: Duration,

    /// IANA zone used when formatting timestamps for display.
    pub timezone: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            position: SourceSettings::new(DEFAULT_POSITION_URL, DEFAULT_POSITION_INTERVAL_SECS),
            snapshot: SourceSettings::new(DEFAULT_SNAPSHOT_URL, DEFAULT_SNAPSHOT_INTERVAL_SECS),
            per_route: SourceSettings::new(DEFAULT_PER_ROUTE_URL, DEFAULT_PER_ROUTE_INTERVAL_SECS),
            routes: Vec::new(),
            shape_url: DEFAULT_SHAPE_URL.to_string(),
            stale_after: None,
            purge_grace: None,
            trail_capacity: DEFAULT_TRAIL_CAPACITY,
            shape_cache_capacity: DEFAULT_SHAPE_CACHE_CAPACITY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            network_retries: 1,
            retry_delay: Duration::from_secs(1),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn source(&self, tag: SourceTag) -> &SourceSettings {
        match tag {
            SourceTag::Position => &self.position,
            SourceTag::Snapshot => &self.snapshot,
            SourceTag::PerRoute => &self.per_route,
        }
    }

    pub fn source_mut(&mut self, tag: SourceTag) -> &mut SourceSettings {
        match tag {
            SourceTag::Position => &mut self.position,
            SourceTag::Snapshot => &mut self.snapshot,
            SourceTag::PerRoute => &mut self.per_route,
        }
    }

    pub fn enabled_sources(&self) -> Vec<SourceTag> {
        SourceTag::ALL
            .into_iter()
            .filter(|tag| self.source(*tag).enabled)
            .collect()
    }

    fn enabled_intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.enabled_sources()
            .into_iter()
            .map(|tag| self.source(tag).interval)
    }

    /// Freshness window: explicit, or 3x the slowest enabled source.
    pub fn stale_after(&self) -> Duration {
        self.stale_after.unwrap_or_else(|| {
            self.enabled_intervals()
                .max()
                .unwrap_or(Duration::from_secs(DEFAULT_POSITION_INTERVAL_SECS))
                .saturating_mul(STALE_INTERVAL_FACTOR)
        })
    }

    pub fn purge_grace(&self) -> Duration {
        self.purge_grace.unwrap_or_else(|| self.sweep_interval())
    }

    /// Cadence of the housekeeping sweep, the fastest enabled interval.
    pub fn sweep_interval(&self) -> Duration {
        self.enabled_intervals()
            .min()
            .unwrap_or(Duration::from_secs(DEFAULT_POSITION_INTERVAL_SECS))
    }

    pub fn display_tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled = self.enabled_sources();
        if enabled.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for tag in enabled {
            if self.source(tag).interval.is_zero() {
                return Err(ConfigError::ZeroInterval { tag });
            }
            if self.source(tag).interval > Duration::from_secs(MAX_INTERVAL_SECS) {
                return Err(ConfigError::IntervalTooLong {
                    tag,
                    max_secs: MAX_INTERVAL_SECS,
                });
            }
        }
        if self.per_route.enabled && self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        if self.trail_capacity == 0 {
            return Err(ConfigError::ZeroTrailCapacity);
        }
        self.display_tz()?;
        Ok(())
    }
}

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "miway-tracker")]
#[command(about = "Live MiWay vehicle tracker merging GTFS-RT, snapshot and per-route feeds")]
pub struct CliArgs {
    /// Port to run the HTTP server on
    #[arg(short, long, env = "SERVER_PORT", default_value = "8080")]
    pub port: u16,

    /// Comma-separated route ids to poll on the per-route feed
    #[arg(long, env = "MIWAY_ROUTES", value_delimiter = ',')]
    pub routes: Vec<String>,

    /// Sources to leave switched off (position, snapshot, per-route)
    #[arg(long = "disable-source", value_delimiter = ',')]
    pub disabled_sources: Vec<SourceTag>,

    #[arg(long, env = "MIWAY_POSITION_URL")]
    pub position_url: Option<String>,

    #[arg(long, env = "MIWAY_SNAPSHOT_URL")]
    pub snapshot_url: Option<String>,

    /// Per-route endpoint, `{route}` is substituted
    #[arg(long, env = "MIWAY_PER_ROUTE_URL")]
    pub per_route_url: Option<String>,

    /// Shape endpoint, `{id}` is substituted
    #[arg(long, env = "MIWAY_SHAPE_URL")]
    pub shape_url: Option<String>,

    #[arg(long, env = "MIWAY_POSITION_INTERVAL_SECS")]
    pub position_interval_secs: Option<u64>,

    #[arg(long, env = "MIWAY_SNAPSHOT_INTERVAL_SECS")]
    pub snapshot_interval_secs: Option<u64>,

    #[arg(long, env = "MIWAY_PER_ROUTE_INTERVAL_SECS")]
    pub per_route_interval_secs: Option<u64>,

    /// Override the freshness window
    #[arg(long, env = "MIWAY_STALE_AFTER_SECS")]
    pub stale_after_secs: Option<u64>,

    #[arg(long, env = "MIWAY_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,
}

impl CliArgs {
    pub fn into_config(self) -> Result<TrackerConfig, ConfigError> {
        let mut config = TrackerConfig {
            routes: self
                .routes
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            timezone: self.timezone,
            stale_after: self.stale_after_secs.map(Duration::from_secs),
            ..TrackerConfig::default()
        };

        for tag in self.disabled_sources {
            config.source_mut(tag).enabled = false;
        }
        // Without routes the per-route feed has nothing to ask for
        if config.routes.is_empty() {
            config.per_route.enabled = false;
        }

        if let Some(url) = self.position_url {
            config.position.url = url;
        }
        if let Some(url) = self.snapshot_url {
            config.snapshot.url = url;
        }
        if let Some(url) = self.per_route_url {
            config.per_route.url = url;
        }
        if let Some(url) = self.shape_url {
            config.shape_url = url;
        }
        if let Some(secs) = self.position_interval_secs {
            config.position.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.snapshot_interval_secs {
            config.snapshot.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.per_route_interval_secs {
            config.per_route.interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}
