// src/sync/mod.rs

//! Synchronization controller.
//!
//! Turns triggers into at most one live pipeline at a time:
//!
//! 1. Every intent to refresh records a new version with the sequencer and
//!    cancels the pipeline of the previous version.
//! 2. [`SyncController::reconcile`] is the single synchronous decision point:
//!    given the current parameters and the latest trigger, it either starts a
//!    pipeline for that version or explains why not.
//! 3. A pipeline commits to the view (and the snapshot slot) only while its
//!    version is still the latest and its token never fired. Stale results are
//!    dropped, so results land in version order without serializing requests.
//! 4. When the primary fetch fails, the snapshot slot for the same
//!    `(strategy, date)` is shown with a warning; otherwise an empty panel with
//!    a classified message.

pub mod state;

pub use state::{
    ApiTimeouts, DashboardView, DetailKey, SyncPhase, SyncSettings, UiParameters, ViewError,
};

use crate::api::{DashboardApi, ForceRefresh, INTRADAY_EXTRA_LIMIT};
use crate::cache::{SnapshotCache, SnapshotMiss, SnapshotPayload};
use crate::clock::ExchangeClock;
use crate::fetch::{CancelToken, FailureKind, FetchError, FetchOptions};
use crate::models::{
    build_local_insight, derive_overview, parse_tickers, RequestParameters, SnapshotContext,
    StockCandidate, StockDetail, StrategyKind, StrategyStatus, TriggerEvent, WeightPreset, Weights,
};
use crate::trigger::{spawn_poller, Debouncer, PollDecision, PollGate, Visibility};
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use state::{ControllerState, InFlight};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Warning shown next to data restored from the snapshot slot.
pub const CACHED_DATA_WARNING: &str =
    "Could not load fresh data; showing cached data from the last successful load.";

// =============================================================================
// Pipeline Types
// =============================================================================

/// Why `reconcile` did not start a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ShutDown,
    WatchlistPending,
    AvailabilityPending,
    AvailabilityForOtherDate,
    TriggerForOtherDate,
    AlreadyProcessed,
}

/// Everything one pipeline run needs, frozen at reconcile time.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub version: u64,
    pub params: RequestParameters,
    pub force_refresh: Option<ForceRefresh>,
    pub load_intraday_extra: bool,
    pub live_date: NaiveDate,
    token: CancelToken,
}

impl PipelinePlan {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[derive(Debug)]
pub enum Reconcile {
    Start(PipelinePlan),
    /// Version consumed; the view shows why nothing can be queried.
    NoStrategy,
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Success {
        data: SnapshotPayload,
        resolved_date: NaiveDate,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub version: u64,
    pub result: PipelineResult,
    /// The result (or its fallback) reached the view.
    pub committed: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategySelection {
    Selected,
    Unavailable(String),
}

#[derive(Debug)]
pub enum DetailToggle {
    Collapsed,
    Expanded(StockDetail),
    Failed(FetchError),
}

/// User-facing message for a failed fetch.
pub fn describe_failure(error: &FetchError, api_base: &str) -> String {
    match error {
        FetchError::Cancelled => "The request was cancelled.".to_string(),
        FetchError::Timeout(_) => {
            "The request took too long. Please try again shortly.".to_string()
        }
        FetchError::Network(_) => format!(
            "Network connection error. Check the backend address ({}) and its CORS/CSP settings.",
            api_base
        ),
        FetchError::Http { message, .. } => message.clone(),
        FetchError::Decode(_) => "Could not load data.".to_string(),
    }
}

// =============================================================================
// Controller
// =============================================================================

struct Inner {
    api: DashboardApi,
    clock: ExchangeClock,
    cache: SnapshotCache,
    /// Version of the last snapshot written. Held across the write so slots
    /// land in version order.
    snapshot_writes: tokio::sync::Mutex<u64>,
    settings: SyncSettings,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<DashboardView>,
    wake: Notify,
    input_debouncer: Debouncer,
    notice_timer: Debouncer,
    visibility: Visibility,
    root: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones drive the same controller.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    /// The initial trigger (version 1) is issued for `initial.date`.
    pub fn new(
        api: DashboardApi,
        clock: ExchangeClock,
        cache: SnapshotCache,
        settings: SyncSettings,
        initial: UiParameters,
    ) -> Self {
        let root = CancelToken::new();
        let start_date = initial.date;
        let state = ControllerState::new(initial, start_date, &root);
        let (view_tx, _) = watch::channel(state.view.clone());

        Self {
            inner: Arc::new(Inner {
                api,
                clock,
                cache,
                snapshot_writes: tokio::sync::Mutex::new(0),
                input_debouncer: Debouncer::new(settings.debounce),
                notice_timer: Debouncer::new(settings.notice_ttl),
                settings,
                state: Mutex::new(state),
                view_tx,
                wake: Notify::new(),
                visibility: Visibility::default(),
                root,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, st: &mut ControllerState) {
        st.sync_view_params();
        self.inner.view_tx.send_replace(st.view.clone());
    }

    fn wake(&self) {
        self.inner.wake.notify_one();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.inner.view_tx.subscribe()
    }

    pub fn view(&self) -> DashboardView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn latest_trigger(&self) -> TriggerEvent {
        self.lock().sequencer.latest()
    }

    pub fn parameters(&self) -> UiParameters {
        self.lock().params.clone()
    }

    pub fn visibility(&self) -> Visibility {
        self.inner.visibility.clone()
    }

    pub fn clock(&self) -> &ExchangeClock {
        &self.inner.clock
    }

    pub fn api(&self) -> &DashboardApi {
        &self.inner.api
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    fn record_trigger_locked(&self, st: &mut ControllerState, for_date: NaiveDate) -> TriggerEvent {
        let event = st.sequencer.record(for_date);
        if let Some(previous) = st.in_flight.take() {
            debug!(
                "SyncController: v{} supersedes v{}, cancelling",
                event.version, previous.version
            );
            previous.token.cancel();
        }
        event
    }

    /// Records a trigger for `for_date` (default: the selected date).
    pub fn record_trigger(&self, for_date: Option<NaiveDate>) -> TriggerEvent {
        let event = {
            let mut st = self.lock();
            let date = for_date.unwrap_or(st.params.date);
            let event = self.record_trigger_locked(&mut st, date);
            self.publish(&mut st);
            event
        };
        self.wake();
        event
    }

    /// Manual refresh.
    pub fn refresh(&self) -> TriggerEvent {
        self.record_trigger(None)
    }

    /// Mutates parameters, invalidates drill-downs and records a trigger.
    fn change_params<F>(&self, mutate: F) -> TriggerEvent
    where
        F: FnOnce(&mut UiParameters),
    {
        let event = {
            let mut st = self.lock();
            mutate(&mut st.params);
            st.invalidate_details(&self.inner.root);
            let date = st.params.date;
            let event = self.record_trigger_locked(&mut st, date);
            self.publish(&mut st);
            event
        };
        self.wake();
        event
    }

    /// Scheduled tick: triggers only when visible, on the live date and
    /// inside the intraday window.
    pub fn poll_tick(&self) -> PollDecision {
        let live_date = self.inner.clock.today();
        let in_window = self.inner.clock.is_intraday_window();
        let visible = self.inner.visibility.is_visible();

        let decision = {
            let mut st = self.lock();
            let decision = PollGate::evaluate(visible, st.params.date, live_date, in_window);
            if decision == PollDecision::Fire {
                let date = st.params.date;
                let event = self.record_trigger_locked(&mut st, date);
                debug!("SyncController: scheduled refresh v{}", event.version);
                self.publish(&mut st);
            }
            decision
        };

        if decision == PollDecision::Fire {
            self.wake();
        } else {
            debug!("SyncController: scheduled tick skipped ({:?})", decision);
        }
        decision
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.visibility.set_visible(visible);
    }

    // =========================================================================
    // Parameter Commands
    // =========================================================================

    /// Changes the date; availability for it is re-fetched in the background.
    pub fn select_date(&self, date: NaiveDate) -> TriggerEvent {
        let event = self.change_params(|p| p.date = date);
        info!("SyncController: date -> {} (v{})", date, event.version);

        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.refresh_availability().await;
        });
        event
    }

    pub fn set_weights(&self, weights: Weights) -> TriggerEvent {
        let weights = weights.normalized();
        self.change_params(|p| p.weights = weights)
    }

    pub fn apply_preset(&self, preset: WeightPreset) -> TriggerEvent {
        self.set_weights(preset.weights())
    }

    /// Adopts the weights suggested by the current regime recommendation and
    /// turns automatic regime weighting off. Returns `None` when nothing is
    /// recommended.
    pub fn apply_recommended_weights(&self) -> Option<TriggerEvent> {
        let suggested = {
            let st = self.lock();
            st.view
                .overview
                .as_ref()
                .and_then(|o| o.regime_recommendation.as_ref())
                .map(|r| r.suggested_weights.normalized())
        }?;
        Some(self.change_params(|p| {
            p.weights = suggested;
            p.auto_regime_weights = false;
        }))
    }

    pub fn set_auto_regime_weights(&self, enabled: bool) -> TriggerEvent {
        self.change_params(|p| p.auto_regime_weights = enabled)
    }

    pub fn set_exposure_cap(&self, enabled: bool) -> TriggerEvent {
        self.change_params(|p| p.enforce_exposure_cap = enabled)
    }

    pub fn set_max_per_sector(&self, cap: u32) -> TriggerEvent {
        self.change_params(|p| p.max_per_sector = cap)
    }

    pub fn set_show_intraday_extra(&self, show: bool) -> TriggerEvent {
        self.change_params(|p| p.show_intraday_extra = show)
    }

    /// Free-text ticker input. The trigger is debounced; drill-downs are
    /// invalidated right away.
    pub fn set_custom_tickers(&self, input: &str) {
        {
            let mut st = self.lock();
            if st.params.custom_input == input {
                return;
            }
            st.params.custom_input = input.to_string();
            st.invalidate_details(&self.inner.root);
            self.publish(&mut st);
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.input_debouncer.call(async move {
            if let Some(inner) = weak.upgrade() {
                let event = SyncController::from_inner(inner).record_trigger(None);
                debug!("SyncController: ticker input settled (v{})", event.version);
            }
        });
    }

    // =========================================================================
    // Notices
    // =========================================================================

    fn set_notice_locked(&self, st: &mut ControllerState, message: String) {
        st.notice_seq += 1;
        let id = st.notice_seq;
        st.view.notice = Some(message);

        let weak = Arc::downgrade(&self.inner);
        self.inner.notice_timer.call(async move {
            if let Some(inner) = weak.upgrade() {
                let this = SyncController::from_inner(inner);
                let mut st = this.lock();
                if st.notice_seq == id {
                    st.view.notice = None;
                    this.publish(&mut st);
                }
            }
        });
    }

    fn clear_notice_locked(&self, st: &mut ControllerState) {
        st.notice_seq += 1;
        st.view.notice = None;
        self.inner.notice_timer.cancel();
    }

    /// Shows a transient notice; it expires after the configured TTL.
    pub fn show_notice(&self, message: impl Into<String>) {
        let mut st = self.lock();
        self.set_notice_locked(&mut st, message.into());
        self.publish(&mut st);
    }

    // =========================================================================
    // Availability
    // =========================================================================

    fn unavailable_message(status: Option<&StrategyStatus>, kind: StrategyKind) -> String {
        status
            .map(|s| s.messages.for_strategy(kind))
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} cannot be queried right now.", kind.label()))
    }

    /// Installs a freshly loaded availability. A selected strategy that fell
    /// out is cleared with a notice and the default is adopted.
    fn apply_availability_locked(&self, st: &mut ControllerState, status: StrategyStatus) {
        let previous = st.params.strategy;
        let next = match previous {
            Some(kind) if status.is_available(kind) => Some(kind),
            Some(kind) => {
                let message = Self::unavailable_message(Some(&status), kind);
                warn!("SyncController: {} no longer available: {}", kind, message);
                self.set_notice_locked(st, message);
                status.default_strategy
            }
            None => status.default_strategy,
        };
        st.availability = Some(status);

        if next != previous {
            info!("SyncController: strategy {:?} -> {:?}", previous, next);
            st.params.strategy = next;
            st.invalidate_details(&self.inner.root);
            let date = st.params.date;
            self.record_trigger_locked(st, date);
        }
    }

    /// Loads availability for the selected date. Superseded loads are
    /// cancelled; a load for a date that is no longer selected is dropped.
    pub async fn refresh_availability(&self) -> Result<(), FetchError> {
        let (date, token) = {
            let mut st = self.lock();
            if let Some(previous) = st.availability_token.take() {
                previous.cancel();
            }
            let token = self.inner.root.child();
            st.availability_token = Some(token.clone());
            (st.params.date, token)
        };

        let options = FetchOptions::new(self.inner.settings.timeouts.status).with_signal(&token);
        let result = self.inner.api.strategy_status(date, options).await;

        let outcome = {
            let mut st = self.lock();
            if token.is_cancelled() || st.params.date != date {
                debug!("SyncController: availability for {} superseded", date);
                return Err(FetchError::Cancelled);
            }
            st.availability_token = None;

            let outcome = match result {
                Ok(status) => {
                    if status.requested_date != date {
                        warn!(
                            "SyncController: availability answered for {} instead of {}",
                            status.requested_date, date
                        );
                    }
                    debug!(
                        "SyncController: availability for {}: {:?}",
                        date, status.available_strategies
                    );
                    self.apply_availability_locked(&mut st, status);
                    Ok(())
                }
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    error!("SyncController: availability for {} failed: {}", date, e);
                    st.availability = None;
                    if st.params.strategy.take().is_some() {
                        st.invalidate_details(&self.inner.root);
                    }
                    st.view.phase = SyncPhase::Idle;
                    st.view.error = Some(ViewError::new(
                        Some(e.kind()),
                        describe_failure(&e, self.inner.api.base_url()),
                    ));
                    Err(e)
                }
            };
            self.publish(&mut st);
            outcome
        };

        self.wake();
        outcome
    }

    /// Re-checks availability, then selects `kind` if it can be queried.
    pub async fn select_strategy(&self, kind: StrategyKind) -> StrategySelection {
        let date = self.lock().params.date;
        let options =
            FetchOptions::new(self.inner.settings.timeouts.status_probe).with_signal(&self.inner.root);
        let probe = self.inner.api.strategy_status(date, options).await;

        let selection = {
            let mut st = self.lock();
            match probe {
                Ok(status) if status.requested_date == st.params.date => {
                    st.availability = Some(status);
                }
                Ok(_) => {}
                Err(e) => debug!("SyncController: availability probe failed, keeping last: {}", e),
            }

            let available = st
                .availability
                .as_ref()
                .map(|a| a.is_available(kind))
                .unwrap_or(false);

            if !available {
                let message = Self::unavailable_message(st.availability.as_ref(), kind);
                self.set_notice_locked(&mut st, message.clone());
                self.publish(&mut st);
                StrategySelection::Unavailable(message)
            } else {
                self.clear_notice_locked(&mut st);
                st.view.error = None;
                if st.params.strategy != Some(kind) {
                    st.params.strategy = Some(kind);
                    st.invalidate_details(&self.inner.root);
                }
                let date = st.params.date;
                let event = self.record_trigger_locked(&mut st, date);
                info!("SyncController: strategy -> {} (v{})", kind, event.version);
                self.publish(&mut st);
                StrategySelection::Selected
            }
        };

        if selection == StrategySelection::Selected {
            self.wake();
        }
        selection
    }

    // =========================================================================
    // Watchlist
    // =========================================================================

    /// Loads the watchlist. The prerequisite flag is set even on failure so
    /// the dashboard never waits on it forever.
    pub async fn load_watchlist(&self) {
        let options =
            FetchOptions::new(self.inner.settings.timeouts.watchlist).with_signal(&self.inner.root);
        let result = self.inner.api.watchlist(options).await;

        {
            let mut st = self.lock();
            match result {
                Ok(response) => {
                    if st.params.watchlist != response.tickers {
                        st.params.watchlist = response.tickers;
                        st.invalidate_details(&self.inner.root);
                    }
                    info!("SyncController: watchlist loaded ({} tickers)", st.params.watchlist.len());
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("SyncController: watchlist load failed: {}", e),
            }
            st.watchlist_loaded = true;
            self.publish(&mut st);
        }
        self.wake();
    }

    fn mutation_options(&self) -> FetchOptions {
        FetchOptions::new(self.inner.settings.timeouts.watchlist).with_signal(&self.inner.root)
    }

    fn adopt_watchlist(&self, tickers: Vec<String>) -> Vec<String> {
        let kept = tickers.clone();
        self.change_params(|p| p.watchlist = tickers);
        kept
    }

    /// Adds comma-separated tickers. Empty input is a no-op.
    pub async fn add_to_watchlist(&self, input: &str) -> Result<Vec<String>, FetchError> {
        let tickers = parse_tickers(input);
        if tickers.is_empty() {
            return Ok(self.lock().params.watchlist.clone());
        }
        match self.inner.api.add_to_watchlist(&tickers, self.mutation_options()).await {
            Ok(response) => Ok(self.adopt_watchlist(response.tickers)),
            Err(e) => {
                warn!("SyncController: watchlist add failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn remove_from_watchlist(&self, ticker: &str) -> Result<Vec<String>, FetchError> {
        match self
            .inner
            .api
            .remove_from_watchlist(ticker, self.mutation_options())
            .await
        {
            Ok(response) => Ok(self.adopt_watchlist(response.tickers)),
            Err(e) => {
                warn!("SyncController: watchlist remove of {} failed: {}", ticker, e);
                Err(e)
            }
        }
    }

    pub async fn upload_watchlist_csv(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        replace: bool,
    ) -> Result<Vec<String>, FetchError> {
        match self
            .inner
            .api
            .upload_watchlist_csv(file_name, contents, replace, self.mutation_options())
            .await
        {
            Ok(response) => Ok(self.adopt_watchlist(response.tickers)),
            Err(e) => {
                warn!("SyncController: watchlist CSV upload failed: {}", e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Row Details
    // =========================================================================

    /// Expands or collapses one row. Details are memoized per
    /// `(strategy, code)` until the next parameter change.
    pub async fn toggle_detail(&self, code: &str, strategy: StrategyKind) -> DetailToggle {
        let key = DetailKey {
            strategy,
            code: code.to_string(),
        };

        let (params, token, epoch) = {
            let mut st = self.lock();
            if st.view.expanded.as_ref() == Some(&key) {
                st.view.expanded = None;
                st.view.detail = None;
                self.publish(&mut st);
                return DetailToggle::Collapsed;
            }

            st.view.expanded = Some(key.clone());
            if let Some(detail) = st.details.get(&key).cloned() {
                st.view.detail = Some(detail.clone());
                self.publish(&mut st);
                return DetailToggle::Expanded(detail);
            }
            st.view.detail = None;
            self.publish(&mut st);
            (
                st.params.request_parameters(strategy),
                st.detail_token.clone(),
                st.detail_epoch,
            )
        };

        let options = FetchOptions::new(self.inner.settings.timeouts.detail).with_signal(&token);
        match self.inner.api.stock_detail(code, strategy, &params, options).await {
            Ok(detail) => {
                let mut st = self.lock();
                if st.detail_epoch == epoch {
                    st.details.insert(key.clone(), detail.clone());
                    if st.view.expanded.as_ref() == Some(&key) {
                        st.view.detail = Some(detail.clone());
                    }
                    self.publish(&mut st);
                }
                DetailToggle::Expanded(detail)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("SyncController: detail for {}/{} failed: {}", strategy, code, e);
                }
                DetailToggle::Failed(e)
            }
        }
    }

    // =========================================================================
    // Reconcile & Pipeline
    // =========================================================================

    /// Decides whether the latest trigger needs a pipeline, and if so claims
    /// its version and supersedes whatever is in flight.
    pub fn reconcile(&self) -> Reconcile {
        let mut st = self.lock();
        let latest = st.sequencer.latest();

        let skip = if self.inner.root.is_cancelled() {
            Some(SkipReason::ShutDown)
        } else if !st.watchlist_loaded {
            Some(SkipReason::WatchlistPending)
        } else if latest.issued_for_date != st.params.date {
            Some(SkipReason::TriggerForOtherDate)
        } else if st
            .availability
            .as_ref()
            .is_some_and(|a| a.requested_date != st.params.date)
        {
            Some(SkipReason::AvailabilityForOtherDate)
        } else if st.last_processed == Some(latest.version) {
            Some(SkipReason::AlreadyProcessed)
        } else if st.params.strategy.is_none() && st.availability.is_none() {
            Some(SkipReason::AvailabilityPending)
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!("SyncController: v{} not started ({:?})", latest.version, reason);
            return Reconcile::Skip(reason);
        }

        st.last_processed = Some(latest.version);

        let Some(strategy) = st.params.strategy else {
            let reason = st
                .availability
                .as_ref()
                .map(|a| a.unavailable_reason())
                .unwrap_or_default();
            info!("SyncController: v{} has no strategy: {}", latest.version, reason);
            let date = st.params.date;
            st.view.clear_data(date);
            st.view.phase = SyncPhase::Idle;
            st.view.version = latest.version;
            st.view.error = Some(ViewError::new(None, reason));
            self.publish(&mut st);
            return Reconcile::NoStrategy;
        };

        if let Some(previous) = st.in_flight.take() {
            previous.token.cancel();
        }
        let token = self.inner.root.child();
        st.in_flight = Some(InFlight {
            version: latest.version,
            token: token.clone(),
        });

        let live_date = self.inner.clock.today();
        let params = st.params.request_parameters(strategy);
        let force_refresh = (strategy == StrategyKind::Intraday && params.date == live_date)
            .then_some(ForceRefresh {
                refresh_token: latest.version,
            });
        let load_intraday_extra = st.params.show_intraday_extra
            && strategy != StrategyKind::Intraday
            && st
                .availability
                .as_ref()
                .is_some_and(|a| a.is_available(StrategyKind::Intraday));

        st.view.phase = SyncPhase::Fetching;
        st.view.error = None;
        self.publish(&mut st);

        info!(
            "SyncController: v{} started ({} {}{})",
            latest.version,
            strategy,
            params.date,
            if force_refresh.is_some() { ", forced" } else { "" }
        );

        Reconcile::Start(PipelinePlan {
            version: latest.version,
            params,
            force_refresh,
            load_intraday_extra,
            live_date,
            token,
        })
    }

    async fn fetch_primary(&self, plan: &PipelinePlan) -> Result<Vec<StockCandidate>, FetchError> {
        let timeouts = self.inner.settings.timeouts;
        let api = &self.inner.api;
        let strategy = plan.params.strategy;

        let first = api
            .stock_candidates(
                &plan.params,
                strategy,
                plan.force_refresh,
                FetchOptions::new(timeouts.candidates).with_signal(&plan.token),
            )
            .await;

        match first {
            Err(FetchError::Timeout(after)) if plan.force_refresh.is_some() => {
                warn!(
                    "SyncController: forced refresh v{} timed out after {:?}, retrying without it",
                    plan.version, after
                );
                api.stock_candidates(
                    &plan.params,
                    strategy,
                    None,
                    FetchOptions::new(timeouts.retry).with_signal(&plan.token),
                )
                .await
            }
            other => other,
        }
    }

    /// Runs one pipeline to completion and commits it if still current.
    pub async fn run_pipeline(&self, plan: PipelinePlan) -> PipelineReport {
        let version = plan.version;
        let context = plan.params.snapshot_context();

        match self.fetch_primary(&plan).await {
            Ok(candidates) => {
                let (overview, effective_date) =
                    derive_overview(&candidates, plan.params.strategy, plan.params.date);
                let insight = build_local_insight(&overview, plan.params.strategy);
                let payload = SnapshotPayload {
                    effective_date,
                    overview,
                    candidates,
                    intraday_extra: Vec::new(),
                    insight: Some(insight),
                };

                let committed = {
                    let mut st = self.lock();
                    if st.is_current(version, &plan.token) {
                        st.view.apply_payload(&payload);
                        st.view.phase = SyncPhase::Committed;
                        st.view.version = version;
                        st.view.error = None;
                        st.view.from_cache = false;
                        self.publish(&mut st);
                        true
                    } else {
                        false
                    }
                };

                if committed {
                    info!(
                        "SyncController: v{} committed {} candidates for {}",
                        version,
                        payload.candidates.len(),
                        effective_date
                    );
                    self.persist_snapshot(&plan, context, payload.clone()).await;
                    self.spawn_secondary(&plan);
                } else {
                    debug!("SyncController: v{} finished stale, dropped", version);
                }

                PipelineReport {
                    version,
                    result: PipelineResult::Success {
                        data: payload,
                        resolved_date: effective_date,
                    },
                    committed,
                    from_cache: false,
                }
            }
            Err(e) => self.handle_primary_failure(&plan, e).await,
        }
    }

    /// Writes the slot unless a newer trigger exists or a newer version
    /// already wrote it.
    async fn persist_snapshot(
        &self,
        plan: &PipelinePlan,
        context: SnapshotContext,
        payload: SnapshotPayload,
    ) {
        let mut last_written = self.inner.snapshot_writes.lock().await;
        let current = self.lock().is_current(plan.version, &plan.token);
        if !current || plan.version <= *last_written {
            debug!(
                "SyncController: v{} snapshot skipped (last written v{})",
                plan.version, *last_written
            );
            return;
        }
        match self.inner.cache.write_snapshot(context, payload).await {
            Ok(()) => *last_written = plan.version,
            Err(e) => warn!("SyncController: snapshot write failed: {}", e),
        }
    }

    /// Reads the slot after any write in progress has landed.
    async fn read_snapshot(
        &self,
        context: SnapshotContext,
    ) -> Result<SnapshotPayload, SnapshotMiss> {
        let _writes = self.inner.snapshot_writes.lock().await;
        self.inner.cache.read_snapshot(context).await
    }

    async fn handle_primary_failure(&self, plan: &PipelinePlan, e: FetchError) -> PipelineReport {
        let version = plan.version;
        let failure = PipelineResult::Failure {
            kind: e.kind(),
            message: describe_failure(&e, self.inner.api.base_url()),
        };
        let report = |committed: bool, from_cache: bool| PipelineReport {
            version,
            result: failure.clone(),
            committed,
            from_cache,
        };

        let still_current = {
            let mut st = self.lock();
            let current = !e.is_cancelled() && st.is_current(version, &plan.token);
            if current {
                st.invalidate_details(&self.inner.root);
            }
            current
        };
        if !still_current {
            debug!("SyncController: v{} failed after being superseded: {}", version, e);
            return report(false, false);
        }
        warn!("SyncController: v{} primary fetch failed: {}", version, e);

        let cached = self.read_snapshot(plan.params.snapshot_context()).await;

        let mut st = self.lock();
        if !st.is_current(version, &plan.token) {
            return report(false, false);
        }

        st.view.version = version;
        st.view.phase = SyncPhase::Degraded;
        let from_cache = match cached {
            Ok(payload) => {
                info!("SyncController: v{} showing cached snapshot", version);
                st.view.apply_payload(&payload);
                st.view.from_cache = true;
                st.view.error = Some(ViewError::new(Some(e.kind()), CACHED_DATA_WARNING));
                true
            }
            Err(miss) => {
                debug!("SyncController: no usable snapshot ({:?})", miss);
                let date = plan.params.date;
                st.view.clear_data(date);
                st.view.error = Some(ViewError::new(
                    Some(e.kind()),
                    describe_failure(&e, self.inner.api.base_url()),
                ));
                false
            }
        };
        self.publish(&mut st);
        report(true, from_cache)
    }

    /// Validation gate, regime weight recommendation and intraday side panel.
    /// Detached; failures are logged and results only land while the
    /// pipeline is current.
    fn spawn_secondary(&self, plan: &PipelinePlan) {
        let timeouts = self.inner.settings.timeouts;

        let this = self.clone();
        let params = plan.params.clone();
        let token = plan.token.clone();
        let version = plan.version;
        tokio::spawn(async move {
            let options = FetchOptions::new(timeouts.validation).with_signal(&token);
            match this.inner.api.strategy_validation(&params, options).await {
                Ok(validation) => {
                    let mut st = this.lock();
                    if st.is_current(version, &token) {
                        st.view.validation = Some(validation);
                        this.publish(&mut st);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("SyncController: validation for v{} ignored: {}", version, e),
            }
        });

        let this = self.clone();
        let params = plan.params.clone();
        let token = plan.token.clone();
        tokio::spawn(async move {
            let options = FetchOptions::new(timeouts.validation).with_signal(&token);
            match this.inner.api.weights_recommendation(&params, options).await {
                Ok(recommendation) => {
                    let mut st = this.lock();
                    if !st.is_current(version, &token) {
                        return;
                    }
                    if let Some(overview) = st.view.overview.as_mut() {
                        overview.regime_recommendation = recommendation.regime_recommendation;
                        let insight = build_local_insight(overview, params.strategy);
                        st.view.insight = Some(insight);
                        this.publish(&mut st);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(
                    "SyncController: weight recommendation for v{} ignored: {}",
                    version, e
                ),
            }
        });

        if !plan.load_intraday_extra {
            return;
        }

        let this = self.clone();
        let params = plan.params.clone();
        let token = plan.token.clone();
        let force = (params.date == plan.live_date).then_some(ForceRefresh {
            refresh_token: version,
        });
        tokio::spawn(async move {
            let options = FetchOptions::new(timeouts.intraday_extra).with_signal(&token);
            match this
                .inner
                .api
                .stock_candidates(&params, StrategyKind::Intraday, force, options)
                .await
            {
                Ok(mut extra) => {
                    extra.truncate(INTRADAY_EXTRA_LIMIT);
                    let mut st = this.lock();
                    if st.is_current(version, &token) {
                        st.view.intraday_extra = extra;
                        this.publish(&mut st);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("SyncController: intraday panel for v{} ignored: {}", version, e),
            }
        });
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads prerequisites and runs the pipeline for the current trigger.
    /// Returns `None` when nothing could be started.
    pub async fn sync_once(&self) -> Option<PipelineReport> {
        self.load_watchlist().await;
        if let Err(e) = self.refresh_availability().await {
            warn!("SyncController: continuing without availability: {}", e);
        }
        match self.reconcile() {
            Reconcile::Start(plan) => Some(self.run_pipeline(plan).await),
            _ => None,
        }
    }

    async fn drive(&self) {
        loop {
            if let Reconcile::Start(plan) = self.reconcile() {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_pipeline(plan).await;
                });
            }
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = self.inner.root.cancelled() => break,
            }
        }
        debug!("SyncController: drive loop stopped");
    }

    /// Spawns the drive loop, prerequisite loads, the availability refresher
    /// and the scheduled poller.
    pub fn start(&self) {
        let mut handles = Vec::new();

        let this = self.clone();
        handles.push(tokio::spawn(async move { this.drive().await }));

        let this = self.clone();
        handles.push(tokio::spawn(async move { this.load_watchlist().await }));

        let this = self.clone();
        let period = self.inner.settings.availability_refresh;
        handles.push(tokio::spawn(async move {
            let _ = this.refresh_availability().await;
            if period.is_zero() {
                return;
            }
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let _ = this.refresh_availability().await;
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        if let Some(handle) = spawn_poller(self.inner.settings.auto_reload, move || {
            if let Some(inner) = weak.upgrade() {
                SyncController::from_inner(inner).poll_tick();
            }
        }) {
            handles.push(handle);
        }

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        info!("SyncController: started");
    }

    /// Cancels every in-flight request and stops background tasks.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.input_debouncer.cancel();
        self.inner.notice_timer.cancel();
        {
            let mut st = self.lock();
            st.in_flight = None;
            st.availability_token = None;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            handle.abort();
        }
        info!("SyncController: shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_failure_classes() {
        let base = "http://api.test";
        assert!(describe_failure(&FetchError::Timeout(std::time::Duration::from_secs(1)), base)
            .contains("too long"));
        assert!(describe_failure(&FetchError::Network("refused".into()), base)
            .contains("http://api.test"));
        assert_eq!(
            describe_failure(
                &FetchError::Http {
                    status: 400,
                    body: String::new(),
                    message: "bad date".into()
                },
                base
            ),
            "bad date"
        );
    }
}
