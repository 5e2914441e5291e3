// src/config.rs
//
// Configuration file parsing for the dashboard sync client.
// Every section and field is optional; missing values take the defaults below.

use crate::clock::TradingWindow;
use crate::models::{StrategyKind, WeightPreset};
use crate::offline::OfflineSettings;
use crate::sync::{ApiTimeouts, SyncSettings, UiParameters};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

// =============================================================================
// Configuration Types
// =============================================================================

/// Root configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub api: ApiConfig,
    pub schedule: ScheduleConfig,
    pub cache: CacheConfig,
    pub offline: OfflineConfig,
    pub dashboard: DashboardConfig,
}

/// Global configuration settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Dashboard port (None = no server outside `serve` mode)
    pub dashboard_port: Option<u16>,
    /// Default log filter when RUST_LOG is unset
    pub log_level: Option<String>,
}

/// Backend endpoint and per-call deadlines.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_key: String,
    pub candidates_timeout_ms: u64,
    pub retry_timeout_ms: u64,
    pub status_timeout_ms: u64,
    pub status_probe_timeout_ms: u64,
    pub validation_timeout_ms: u64,
    pub intraday_extra_timeout_ms: u64,
    pub detail_timeout_ms: u64,
    pub watchlist_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            user_key: "default".to_string(),
            candidates_timeout_ms: 70_000,
            retry_timeout_ms: 20_000,
            status_timeout_ms: 12_000,
            status_probe_timeout_ms: 8_000,
            validation_timeout_ms: 12_000,
            intraday_extra_timeout_ms: 15_000,
            detail_timeout_ms: 15_000,
            watchlist_timeout_ms: 8_000,
        }
    }
}

/// Exchange calendar, polling and input pacing.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub timezone: String,
    pub intraday_start: String,
    pub intraday_end: String,
    /// 0 disables scheduled refresh
    pub auto_reload_minutes: u64,
    /// 0 disables the periodic availability re-check
    pub availability_refresh_secs: u64,
    pub debounce_ms: u64,
    pub notice_ttl_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: crate::clock::DEFAULT_EXCHANGE_TZ.to_string(),
            intraday_start: "09:05".to_string(),
            intraday_end: "15:20".to_string(),
            auto_reload_minutes: 0,
            availability_refresh_secs: 300,
            debounce_ms: 350,
            notice_ttl_ms: 5_000,
        }
    }
}

/// Snapshot slot location.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".dashboard_cache"),
        }
    }
}

/// Offline edge cache in front of the frontend origin.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub prefix: String,
    pub version: String,
    pub api_prefix: String,
    pub upstream: String,
    pub precache: Vec<String>,
    pub network_timeout_ms: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            prefix: "dailystock".to_string(),
            version: "v2".to_string(),
            api_prefix: "/api/v1/".to_string(),
            upstream: "http://localhost:3000".to_string(),
            precache: vec!["/favicon.ico".to_string()],
            network_timeout_ms: 30_000,
        }
    }
}

/// Initial dashboard parameters.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Initial strategy; None waits for the availability default
    pub strategy: Option<String>,
    /// Preset name: balanced, aggressive or defensive
    pub weights: String,
    pub show_intraday_extra: bool,
    pub enforce_exposure_cap: bool,
    pub max_per_sector: u32,
    pub auto_regime_weights: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            weights: "balanced".to_string(),
            show_intraday_extra: true,
            enforce_exposure_cap: true,
            max_per_sector: 2,
            auto_regime_weights: true,
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, String> {
        toml::from_str(s).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn log_level(&self) -> &str {
        self.global.log_level.as_deref().unwrap_or("info")
    }

    pub fn api_timeouts(&self) -> ApiTimeouts {
        let ms = Duration::from_millis;
        ApiTimeouts {
            candidates: ms(self.api.candidates_timeout_ms),
            retry: ms(self.api.retry_timeout_ms),
            status: ms(self.api.status_timeout_ms),
            status_probe: ms(self.api.status_probe_timeout_ms),
            validation: ms(self.api.validation_timeout_ms),
            intraday_extra: ms(self.api.intraday_extra_timeout_ms),
            detail: ms(self.api.detail_timeout_ms),
            watchlist: ms(self.api.watchlist_timeout_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            timeouts: self.api_timeouts(),
            debounce: Duration::from_millis(self.schedule.debounce_ms),
            notice_ttl: Duration::from_millis(self.schedule.notice_ttl_ms),
            auto_reload: Duration::from_secs(self.schedule.auto_reload_minutes * 60),
            availability_refresh: Duration::from_secs(self.schedule.availability_refresh_secs),
        }
    }

    pub fn trading_window(&self) -> Result<TradingWindow, String> {
        TradingWindow::parse(&self.schedule.intraday_start, &self.schedule.intraday_end)
    }

    /// Parameters the controller starts from on `date`.
    pub fn initial_parameters(&self, date: NaiveDate) -> Result<UiParameters, String> {
        let mut params = UiParameters::new(date);
        params.strategy = self
            .dashboard
            .strategy
            .as_deref()
            .map(str::parse::<StrategyKind>)
            .transpose()?;
        params.weights = self.dashboard.weights.parse::<WeightPreset>()?.weights();
        params.show_intraday_extra = self.dashboard.show_intraday_extra;
        params.enforce_exposure_cap = self.dashboard.enforce_exposure_cap;
        params.max_per_sector = self.dashboard.max_per_sector;
        params.auto_regime_weights = self.dashboard.auto_regime_weights;
        Ok(params)
    }

    pub fn offline_settings(&self) -> Result<OfflineSettings, String> {
        let upstream = Url::parse(&self.offline.upstream)
            .map_err(|e| format!("Invalid offline.upstream '{}': {}", self.offline.upstream, e))?;
        let mut settings = OfflineSettings::new(upstream);
        settings.prefix = self.offline.prefix.clone();
        settings.version = self.offline.version.clone();
        settings.api_prefix = self.offline.api_prefix.clone();
        settings.precache = self.offline.precache.clone();
        settings.network_timeout = Duration::from_millis(self.offline.network_timeout_ms);
        Ok(settings)
    }
}

// =============================================================================
// Default Configuration
// =============================================================================

/// Returns a default configuration string for documentation.
pub fn default_config_template() -> &'static str {
    r#"# Stock Dashboard Configuration
#
# Every key is optional; the values below are the defaults.

[global]
# Default log filter (RUST_LOG overrides it)
log_level = "info"
# Web dashboard / edge proxy port
dashboard_port = 8080

[api]
base_url = "http://localhost:8000"
user_key = "default"
candidates_timeout_ms = 70000
# Second attempt after a forced refresh timed out
retry_timeout_ms = 20000
status_timeout_ms = 12000
status_probe_timeout_ms = 8000
validation_timeout_ms = 12000
intraday_extra_timeout_ms = 15000
detail_timeout_ms = 15000
watchlist_timeout_ms = 8000

[schedule]
timezone = "Asia/Seoul"
intraday_start = "09:05"
intraday_end = "15:20"
# 0 = no scheduled refresh
auto_reload_minutes = 0
availability_refresh_secs = 300
debounce_ms = 350
notice_ttl_ms = 5000

[cache]
dir = ".dashboard_cache"

[offline]
prefix = "dailystock"
# Bump to drop every cached response on the next start
version = "v2"
api_prefix = "/api/v1/"
upstream = "http://localhost:3000"
precache = ["/favicon.ico"]
network_timeout_ms = 30000

[dashboard]
# premarket, intraday or close (omit to use the server default)
# strategy = "close"
weights = "balanced"
show_intraday_extra = true
enforce_exposure_cap = true
max_per_sector = 2
auto_regime_weights = true
"#
}

// =============================================================================
// Tests
// =============================================================================
