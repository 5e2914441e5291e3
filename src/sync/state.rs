// src/sync/state.rs

//! Controller-owned state and the view it publishes.

use crate::cache::SnapshotPayload;
use crate::fetch::{CancelToken, FailureKind};
use crate::models::{
    merge_tickers, parse_tickers, MarketInsight, MarketOverview, NonTradingDay,
    RequestParameters, StockCandidate, StockDetail, StrategyKind, StrategyStatus,
    StrategyValidation, TriggerEvent, Weights,
};
use crate::trigger::TriggerSequencer;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Settings
// =============================================================================

/// Per-call deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiTimeouts {
    pub candidates: Duration,
    /// Second candidates attempt after a forced refresh timed out.
    pub retry: Duration,
    pub status: Duration,
    /// Availability re-check when the user picks a strategy.
    pub status_probe: Duration,
    pub validation: Duration,
    pub intraday_extra: Duration,
    pub detail: Duration,
    pub watchlist: Duration,
}

impl Default for ApiTimeouts {
    fn default() -> Self {
        Self {
            candidates: Duration::from_secs(70),
            retry: Duration::from_secs(20),
            status: Duration::from_secs(12),
            status_probe: Duration::from_secs(8),
            validation: Duration::from_secs(12),
            intraday_extra: Duration::from_secs(15),
            detail: Duration::from_secs(15),
            watchlist: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub timeouts: ApiTimeouts,
    pub debounce: Duration,
    pub notice_ttl: Duration,
    /// Scheduled refresh period; zero disables it.
    pub auto_reload: Duration,
    /// Periodic availability re-check; zero disables it.
    pub availability_refresh: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timeouts: ApiTimeouts::default(),
            debounce: Duration::from_millis(350),
            notice_ttl: Duration::from_secs(5),
            auto_reload: Duration::ZERO,
            availability_refresh: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// What the user has selected, before it is frozen into
/// [`RequestParameters`].
#[derive(Debug, Clone, PartialEq)]
pub struct UiParameters {
    pub date: NaiveDate,
    pub strategy: Option<StrategyKind>,
    pub weights: Weights,
    pub auto_regime_weights: bool,
    pub enforce_exposure_cap: bool,
    pub max_per_sector: u32,
    pub watchlist: Vec<String>,
    pub custom_input: String,
    pub show_intraday_extra: bool,
}

impl UiParameters {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            strategy: None,
            weights: Weights::default(),
            auto_regime_weights: true,
            enforce_exposure_cap: true,
            max_per_sector: 2,
            watchlist: Vec::new(),
            custom_input: String::new(),
            show_intraday_extra: true,
        }
    }

    pub fn tickers(&self) -> Vec<String> {
        merge_tickers(&self.watchlist, &parse_tickers(&self.custom_input))
    }

    pub fn request_parameters(&self, strategy: StrategyKind) -> RequestParameters {
        RequestParameters {
            date: self.date,
            strategy,
            weights: self.weights.normalized(),
            auto_regime_weights: self.auto_regime_weights,
            enforce_exposure_cap: self.enforce_exposure_cap,
            max_per_sector: self.max_per_sector,
            tickers: self.tickers(),
        }
    }
}

/// Memo key of a per-row drill-down.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailKey {
    pub strategy: StrategyKind,
    pub code: String,
}

// =============================================================================
// View
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Committed,
    /// Primary fetch failed; showing cached data or an empty panel.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewError {
    pub kind: Option<FailureKind>,
    pub message: String,
}

impl ViewError {
    pub fn new(kind: Option<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a renderer needs. Published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub phase: SyncPhase,
    /// Trigger version of the pipeline that last wrote the data fields.
    pub version: u64,
    pub last_trigger: TriggerEvent,
    pub selected_date: NaiveDate,
    pub strategy: Option<StrategyKind>,
    pub effective_date: NaiveDate,
    pub overview: Option<MarketOverview>,
    pub candidates: Vec<StockCandidate>,
    pub intraday_extra: Vec<StockCandidate>,
    pub insight: Option<MarketInsight>,
    pub validation: Option<StrategyValidation>,
    pub error: Option<ViewError>,
    pub from_cache: bool,
    pub notice: Option<String>,
    pub available_strategies: Vec<StrategyKind>,
    pub non_trading_day: Option<NonTradingDay>,
    pub weights: Weights,
    pub tickers: Vec<String>,
    pub watchlist: Vec<String>,
    pub expanded: Option<DetailKey>,
    pub detail: Option<StockDetail>,
}

impl DashboardView {
    pub fn initial(params: &UiParameters, trigger: TriggerEvent) -> Self {
        Self {
            phase: SyncPhase::Idle,
            version: 0,
            last_trigger: trigger,
            selected_date: params.date,
            strategy: params.strategy,
            effective_date: params.date,
            overview: None,
            candidates: Vec::new(),
            intraday_extra: Vec::new(),
            insight: None,
            validation: None,
            error: None,
            from_cache: false,
            notice: None,
            available_strategies: Vec::new(),
            non_trading_day: None,
            weights: params.weights,
            tickers: params.tickers(),
            watchlist: params.watchlist.clone(),
            expanded: None,
            detail: None,
        }
    }

    /// Empty panel for `date`, optionally with an explanation.
    pub fn clear_data(&mut self, date: NaiveDate) {
        self.overview = None;
        self.candidates.clear();
        self.intraday_extra.clear();
        self.insight = None;
        self.validation = None;
        self.from_cache = false;
        self.effective_date = date;
    }

    pub fn apply_payload(&mut self, payload: &SnapshotPayload) {
        self.effective_date = payload.effective_date;
        self.overview = Some(payload.overview.clone());
        self.candidates = payload.candidates.clone();
        self.intraday_extra = payload.intraday_extra.clone();
        self.insight = payload.insight.clone();
        self.validation = None;
    }
}

// =============================================================================
// Controller State
// =============================================================================

pub(crate) struct InFlight {
    pub version: u64,
    pub token: CancelToken,
}

/// Mutable state of one controller. Only touched under its mutex, never
/// across an await point.
pub(crate) struct ControllerState {
    pub params: UiParameters,
    pub watchlist_loaded: bool,
    pub availability: Option<StrategyStatus>,
    pub availability_token: Option<CancelToken>,
    pub sequencer: TriggerSequencer,
    pub last_processed: Option<u64>,
    pub in_flight: Option<InFlight>,
    pub details: HashMap<DetailKey, StockDetail>,
    pub detail_epoch: u64,
    pub detail_token: CancelToken,
    pub notice_seq: u64,
    pub view: DashboardView,
}

impl ControllerState {
    pub fn new(params: UiParameters, today: NaiveDate, root: &CancelToken) -> Self {
        let sequencer = TriggerSequencer::new(today);
        let view = DashboardView::initial(&params, sequencer.latest());
        Self {
            params,
            watchlist_loaded: false,
            availability: None,
            availability_token: None,
            sequencer,
            last_processed: None,
            in_flight: None,
            details: HashMap::new(),
            detail_epoch: 0,
            detail_token: root.child(),
            notice_seq: 0,
            view,
        }
    }

    /// A result of `version` may still reach the view.
    pub fn is_current(&self, version: u64, token: &CancelToken) -> bool {
        self.sequencer.is_current(version) && !token.is_cancelled()
    }

    /// Drops every memoized drill-down and aborts the ones in flight.
    pub fn invalidate_details(&mut self, root: &CancelToken) {
        self.details.clear();
        self.detail_epoch += 1;
        self.detail_token.cancel();
        self.detail_token = root.child();
        self.view.expanded = None;
        self.view.detail = None;
        self.view.intraday_extra.clear();
        self.view.validation = None;
    }

    /// Copies the parameter fields into the view.
    pub fn sync_view_params(&mut self) {
        self.view.selected_date = self.params.date;
        self.view.strategy = self.params.strategy;
        self.view.weights = self.params.weights;
        self.view.tickers = self.params.tickers();
        self.view.watchlist = self.params.watchlist.clone();
        self.view.last_trigger = self.sequencer.latest();
        self.view.available_strategies = self
            .availability
            .as_ref()
            .map(|a| a.available_strategies.clone())
            .unwrap_or_default();
        self.view.non_trading_day = self
            .availability
            .as_ref()
            .and_then(|a| a.non_trading_day().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parameters_merge_tickers_and_normalize() {
        let mut params = UiParameters::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap());
        params.watchlist = vec!["AAPL".to_string()];
        params.custom_input = "msft, aapl".to_string();
        params.weights = Weights::new(2.0, 1.0, 1.0);

        let req = params.request_parameters(StrategyKind::Close);
        assert_eq!(req.tickers, vec!["AAPL", "MSFT"]);
        assert_eq!(req.weights, Weights::new(0.5, 0.25, 0.25));
    }

    #[test]
    fn test_invalidate_details_bumps_epoch_and_cancels() {
        let root = CancelToken::new();
        let today = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let mut state = ControllerState::new(UiParameters::new(today), today, &root);
        let old_token = state.detail_token.clone();
        state.details.insert(
            DetailKey {
                strategy: StrategyKind::Close,
                code: "005930".to_string(),
            },
            StockDetail::default(),
        );

        state.invalidate_details(&root);
        assert!(state.details.is_empty());
        assert_eq!(state.detail_epoch, 1);
        assert!(old_token.is_cancelled());
        assert!(!state.detail_token.is_cancelled());
    }
}
