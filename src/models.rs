// src/models.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Strategy Kinds
// =============================================================================

/// The three recommendation strategies served by the analytics API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Premarket,
    Intraday,
    Close,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Premarket,
        StrategyKind::Intraday,
        StrategyKind::Close,
    ];

    /// Wire name used in query strings and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Premarket => "premarket",
            StrategyKind::Intraday => "intraday",
            StrategyKind::Close => "close",
        }
    }

    /// Human-readable label for notices.
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::Premarket => "Pre-market strategy",
            StrategyKind::Intraday => "Intraday scalping",
            StrategyKind::Close => "Closing-price strategy",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "premarket" | "pre-market" => Ok(StrategyKind::Premarket),
            "intraday" => Ok(StrategyKind::Intraday),
            "close" | "closing" => Ok(StrategyKind::Close),
            other => Err(format!(
                "unknown strategy '{}' (expected premarket, intraday or close)",
                other
            )),
        }
    }
}

// =============================================================================
// Scoring Weights
// =============================================================================

/// Relative weights of the three scoring factors.
///
/// A normalized value sums to 1.0 (up to four-decimal rounding) and has no
/// negative component. Use [`Weights::normalized`] on anything user-supplied.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(rename = "return")]
    pub ret: f64,
    pub stability: f64,
    pub market: f64,
}

/// Balanced preset, also used when normalization has nothing to divide by.
pub const DEFAULT_WEIGHTS: Weights = Weights {
    ret: 0.4,
    stability: 0.3,
    market: 0.3,
};

impl Weights {
    pub fn new(ret: f64, stability: f64, market: f64) -> Self {
        Self {
            ret,
            stability,
            market,
        }
    }

    /// Sanitizes and re-normalizes the weights.
    ///
    /// Non-finite components take the default component, negatives clamp to
    /// zero, and an all-zero vector yields [`DEFAULT_WEIGHTS`].
    pub fn normalized(self) -> Self {
        let ret = sanitize_component(self.ret, DEFAULT_WEIGHTS.ret);
        let stability = sanitize_component(self.stability, DEFAULT_WEIGHTS.stability);
        let market = sanitize_component(self.market, DEFAULT_WEIGHTS.market);

        let total = ret + stability + market;
        if total <= 0.0 {
            return DEFAULT_WEIGHTS;
        }

        Self {
            ret: round4(ret / total),
            stability: round4(stability / total),
            market: round4(market / total),
        }
    }
}

impl Default for Weights {
    fn default() -> Self {
        DEFAULT_WEIGHTS
    }
}

fn sanitize_component(value: f64, fallback: f64) -> f64 {
    let value = if value.is_finite() { value } else { fallback };
    value.max(0.0)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Named weight presets offered next to the sliders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPreset {
    Balanced,
    Aggressive,
    Defensive,
}

impl WeightPreset {
    pub fn weights(&self) -> Weights {
        match self {
            WeightPreset::Balanced => DEFAULT_WEIGHTS,
            WeightPreset::Aggressive => Weights::new(0.6, 0.2, 0.2),
            WeightPreset::Defensive => Weights::new(0.2, 0.6, 0.2),
        }
    }
}

impl FromStr for WeightPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "balanced" => Ok(WeightPreset::Balanced),
            "aggressive" => Ok(WeightPreset::Aggressive),
            "defensive" => Ok(WeightPreset::Defensive),
            other => Err(format!("unknown weight preset '{}'", other)),
        }
    }
}

// =============================================================================
// Tickers
// =============================================================================

/// Splits comma-separated free text into upper-cased ticker symbols.
pub fn parse_tickers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Watchlist first, then ad-hoc symbols; duplicates keep their first position.
pub fn merge_tickers(watchlist: &[String], adhoc: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(watchlist.len() + adhoc.len());
    for ticker in watchlist.iter().chain(adhoc.iter()) {
        if !merged.contains(ticker) {
            merged.push(ticker.clone());
        }
    }
    merged
}

// =============================================================================
// Request Parameters & Triggers
// =============================================================================

/// Everything that identifies "the query currently being viewed".
///
/// Two parameter sets that compare equal are the same query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    pub date: NaiveDate,
    pub strategy: StrategyKind,
    pub weights: Weights,
    pub auto_regime_weights: bool,
    pub enforce_exposure_cap: bool,
    pub max_per_sector: u32,
    pub tickers: Vec<String>,
}

impl RequestParameters {
    /// Ticker set as the API expects it (`A,B,C`).
    pub fn tickers_query(&self) -> String {
        self.tickers.join(",")
    }

    /// The part of the context the snapshot slot is keyed by.
    pub fn snapshot_context(&self) -> SnapshotContext {
        SnapshotContext {
            strategy: self.strategy,
            selected_date: self.date,
        }
    }
}

/// A versioned intent to refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub version: u64,
    pub issued_for_date: NaiveDate,
}

/// Key of the persisted snapshot slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub strategy: StrategyKind,
    pub selected_date: NaiveDate,
}

// =============================================================================
// API Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeRecommendation {
    pub regime: String,
    pub label: String,
    #[serde(default)]
    pub confidence: f64,
    pub suggested_weights: Weights,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOverview {
    pub up: usize,
    pub steady: usize,
    pub down: usize,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub session_date: Option<String>,
    #[serde(default)]
    pub signal_date: Option<String>,
    #[serde(default)]
    pub strategy_reason: Option<String>,
    #[serde(default)]
    pub regime_recommendation: Option<RegimeRecommendation>,
}

/// One ranked recommendation row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StockCandidate {
    pub rank: u32,
    pub name: String,
    pub code: String,
    pub score: f64,
    pub change_rate: f64,
    pub price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub tags: Vec<String>,
    pub sector: Option<String>,
    pub exposure_deferred: Option<bool>,
    pub summary: String,
    pub sparkline60: Vec<f64>,
    pub applied_weights: Option<Weights>,
    pub strategy: Option<StrategyKind>,
    pub session_date: Option<String>,
    pub signal_date: Option<String>,
    pub strategy_reason: Option<String>,
    pub regime: Option<String>,
    pub real_date: Option<String>,
    /// Raw/weighted factor breakdown and strategy-specific signals.
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInsight {
    pub date: String,
    pub strategy: Option<StrategyKind>,
    pub session_date: Option<String>,
    pub signal_date: Option<String>,
    pub strategy_reason: Option<String>,
    pub risk_factors: Vec<RiskFactor>,
    pub conclusion: String,
}

/// Per-row drill-down (narrative and report fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StockDetail {
    pub ticker: String,
    pub name: String,
    pub strategy: Option<StrategyKind>,
    pub current_price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub expected_return: f64,
    pub tags: Vec<String>,
    pub signals: Vec<Value>,
    pub news_summary3: Vec<String>,
    pub themes: Vec<String>,
    pub ai_report: Option<Value>,
    pub position_sizing: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyMessages {
    pub premarket: String,
    pub intraday: String,
    pub close: String,
}

impl StrategyMessages {
    pub fn for_strategy(&self, kind: StrategyKind) -> &str {
        match kind {
            StrategyKind::Premarket => &self.premarket,
            StrategyKind::Intraday => &self.intraday,
            StrategyKind::Close => &self.close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonTradingDay {
    pub date: String,
    pub reason_type: String,
    pub reason: String,
    #[serde(default)]
    pub holiday_name: Option<String>,
    #[serde(default)]
    pub calendar_provider: Option<String>,
}

/// Response of the strategy-status endpoint: what can be queried for a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStatus {
    #[serde(default)]
    pub timezone: String,
    pub requested_date: NaiveDate,
    #[serde(default)]
    pub available_strategies: Vec<StrategyKind>,
    #[serde(default)]
    pub default_strategy: Option<StrategyKind>,
    #[serde(default)]
    pub messages: StrategyMessages,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub non_trading_day: Option<NonTradingDay>,
}

impl StrategyStatus {
    pub fn is_available(&self, kind: StrategyKind) -> bool {
        self.available_strategies.contains(&kind)
    }

    /// Explanation shown when no strategy can be queried.
    pub fn unavailable_reason(&self) -> String {
        let messages = [
            self.detail.as_deref().unwrap_or(""),
            &self.messages.premarket,
            &self.messages.intraday,
            &self.messages.close,
        ];
        messages
            .iter()
            .find(|m| !m.is_empty())
            .map(|m| m.to_string())
            .unwrap_or_else(|| "No strategy can be queried right now.".to_string())
    }

    /// Non-trading-day details, only when the status says so.
    pub fn non_trading_day(&self) -> Option<&NonTradingDay> {
        match self.error_code.as_deref() {
            Some("NON_TRADING_DAY") => self.non_trading_day.as_ref(),
            _ => None,
        }
    }
}

/// Quality gate verdict; unknown values read as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationGate {
    Pass,
    Fail,
    #[serde(other)]
    Warn,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyValidation {
    pub strategy: Option<StrategyKind>,
    pub as_of_date: Option<String>,
    pub mode: Option<String>,
    pub gate_status: Option<ValidationGate>,
    pub gate_passed: Option<bool>,
    pub insufficient_data: Option<bool>,
    pub validation_penalty: f64,
    pub thresholds: Value,
    pub metrics: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchlistResponse {
    pub user_key: Option<String>,
    pub tickers: Vec<String>,
}

/// Regime-based weight suggestion for a date and ticker universe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightsRecommendation {
    pub date: Option<String>,
    pub custom_tickers: Vec<String>,
    pub regime_recommendation: Option<RegimeRecommendation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthStatus {
    pub status: Option<String>,
    pub database: Option<String>,
}

// =============================================================================
// Payload Helpers
// =============================================================================

/// Accepts either a bare array or `{ "candidates": [...] }`.
///
/// Entries that are not objects or fail to decode are dropped instead of
/// failing the whole list.
pub fn candidates_from_payload(payload: Value) -> Vec<StockCandidate> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("candidates") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter(|item| item.is_object())
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Builds the overview shown above the list from the candidates themselves.
///
/// Returns the overview and the effective session date (first candidate's
/// session or real date, else the selected date).
pub fn derive_overview(
    candidates: &[StockCandidate],
    strategy: StrategyKind,
    selected_date: NaiveDate,
) -> (MarketOverview, NaiveDate) {
    let up = candidates.iter().filter(|c| c.change_rate > 0.0).count();
    let down = candidates.iter().filter(|c| c.change_rate < 0.0).count();
    let steady = candidates.len().saturating_sub(up + down);

    let first = candidates.first();
    let effective_date = first
        .and_then(|c| c.session_date.as_deref().or(c.real_date.as_deref()))
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or(selected_date);
    let signal_date = first
        .and_then(|c| c.signal_date.clone())
        .unwrap_or_else(|| selected_date.to_string());
    let strategy_reason = first
        .and_then(|c| c.strategy_reason.clone())
        .unwrap_or_default();

    let overview = MarketOverview {
        up,
        steady,
        down,
        warnings: Vec::new(),
        strategy: Some(strategy),
        session_date: Some(effective_date.to_string()),
        signal_date: Some(signal_date),
        strategy_reason: Some(strategy_reason),
        regime_recommendation: None,
    };

    (overview, effective_date)
}

/// Local market commentary derived from the up/down balance.
pub fn build_local_insight(overview: &MarketOverview, strategy: StrategyKind) -> MarketInsight {
    let up = overview.up;
    let down = overview.down;
    let mut risk_factors = Vec::new();

    let conclusion = if down > up * 2 {
        risk_factors.push(RiskFactor {
            id: "Risk 1".to_string(),
            description: "Broad downside pressure is high; favour conservative entries.".to_string(),
        });
        "Raise the stability weight and keep stop-loss rules strict."
    } else if up > down * 2 {
        risk_factors.push(RiskFactor {
            id: "Risk 1".to_string(),
            description: "Upside momentum is strong, but watch for short-term overheating."
                .to_string(),
        });
        "Combine staged profit-taking with trend following."
    } else {
        risk_factors.push(RiskFactor {
            id: "Risk 1".to_string(),
            description: "Performance is diverging by name; be selective.".to_string(),
        });
        "Use the weights to narrow candidates down to the preferred factors."
    };

    if let Some(regime) = &overview.regime_recommendation {
        let w = regime.suggested_weights;
        risk_factors.push(RiskFactor {
            id: "Regime".to_string(),
            description: format!(
                "Current regime looks like {}; suggested weights are R {}, S {}, M {}.",
                regime.label, w.ret, w.stability, w.market
            ),
        });
    }

    let session_date = overview.session_date.clone();
    MarketInsight {
        date: session_date.clone().unwrap_or_default(),
        strategy: Some(strategy),
        session_date,
        signal_date: overview.signal_date.clone(),
        strategy_reason: overview.strategy_reason.clone(),
        risk_factors,
        conclusion: conclusion.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_weights_normalize_proportionally() {
        let w = Weights::new(2.0, 1.0, 1.0).normalized();
        assert_eq!(w, Weights::new(0.5, 0.25, 0.25));
    }

    #[test]
    fn test_weights_all_zero_falls_back_to_default() {
        let w = Weights::new(0.0, 0.0, 0.0).normalized();
        assert_eq!(w, DEFAULT_WEIGHTS);
    }

    #[test]
    fn test_weights_clamp_negative_and_non_finite() {
        let w = Weights::new(-3.0, f64::NAN, 0.3).normalized();
        // NaN -> default 0.3, negative -> 0
        assert_eq!(w, Weights::new(0.0, 0.5, 0.5));
        assert!(w.ret >= 0.0 && w.stability >= 0.0 && w.market >= 0.0);
    }

    #[test]
    fn test_weights_rounded_to_four_decimals() {
        let w = Weights::new(1.0, 1.0, 1.0).normalized();
        assert_eq!(w.ret, 0.3333);
        assert_eq!(w.stability, 0.3333);
        assert_eq!(w.market, 0.3333);
    }

    #[test]
    fn test_weights_wire_format() {
        let json = serde_json::to_value(Weights::new(0.5, 0.25, 0.25)).unwrap();
        assert_eq!(json, json!({"return": 0.5, "stability": 0.25, "market": 0.25}));
    }

    #[test]
    fn test_parse_and_merge_tickers() {
        let adhoc = parse_tickers(" aapl, ,005930 ,msft,");
        assert_eq!(adhoc, vec!["AAPL", "005930", "MSFT"]);

        let watchlist = vec!["MSFT".to_string(), "NVDA".to_string()];
        let merged = merge_tickers(&watchlist, &adhoc);
        assert_eq!(merged, vec!["MSFT", "NVDA", "AAPL", "005930"]);
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("Intraday".parse::<StrategyKind>(), Ok(StrategyKind::Intraday));
        assert_eq!("closing".parse::<StrategyKind>(), Ok(StrategyKind::Close));
        assert!("swing".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_candidates_from_array_or_wrapper() {
        let bare = json!([{"rank": 1, "code": "005930", "changeRate": 1.2}, 42]);
        let cands = candidates_from_payload(bare);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].code, "005930");

        let wrapped = json!({"candidates": [{"rank": 2, "code": "000660"}]});
        assert_eq!(candidates_from_payload(wrapped)[0].rank, 2);

        assert!(candidates_from_payload(json!({"items": []})).is_empty());
        assert!(candidates_from_payload(Value::Null).is_empty());
    }

    #[test]
    fn test_derive_overview_counts_and_dates() {
        let selected = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let cands = vec![
            StockCandidate {
                change_rate: 1.0,
                session_date: Some("2025-01-09".to_string()),
                signal_date: Some("2025-01-08".to_string()),
                ..Default::default()
            },
            StockCandidate {
                change_rate: -0.5,
                ..Default::default()
            },
            StockCandidate::default(),
        ];

        let (overview, effective) = derive_overview(&cands, StrategyKind::Close, selected);
        assert_eq!((overview.up, overview.down, overview.steady), (1, 1, 1));
        assert_eq!(effective, NaiveDate::from_ymd_opt(2025, 1, 9).unwrap());
        assert_eq!(overview.signal_date.as_deref(), Some("2025-01-08"));

        let (_, effective) = derive_overview(&[], StrategyKind::Close, selected);
        assert_eq!(effective, selected);
    }

    #[test]
    fn test_local_insight_reads_balance() {
        let overview = MarketOverview {
            up: 1,
            down: 5,
            ..Default::default()
        };
        let insight = build_local_insight(&overview, StrategyKind::Premarket);
        assert!(insight.conclusion.contains("stability"));
        assert_eq!(insight.risk_factors.len(), 1);
    }

    #[test]
    fn test_validation_gate_unknown_reads_as_warn() {
        let v: StrategyValidation =
            serde_json::from_value(json!({"gateStatus": "something-new"})).unwrap();
        assert_eq!(v.gate_status, Some(ValidationGate::Warn));
    }

    #[test]
    fn test_strategy_status_unavailable_reason() {
        let status: StrategyStatus = serde_json::from_value(json!({
            "requestedDate": "2025-01-11",
            "availableStrategies": [],
            "messages": {"premarket": "", "intraday": "Session closed", "close": ""},
            "errorCode": "NON_TRADING_DAY",
            "nonTradingDay": {"date": "2025-01-11", "reasonType": "weekend", "reason": "Saturday"}
        }))
        .unwrap();
        assert_eq!(status.unavailable_reason(), "Session closed");
        assert_eq!(status.non_trading_day().unwrap().reason, "Saturday");
    }
}
