// src/trigger/poll.rs

use chrono::NaiveDate;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Whether the dashboard is currently being looked at.
/// Clones share the flag; starts visible.
#[derive(Debug, Clone)]
pub struct Visibility(Arc<AtomicBool>);

impl Default for Visibility {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Visibility {
    pub fn set_visible(&self, visible: bool) {
        self.0.store(visible, Ordering::SeqCst);
    }

    pub fn is_visible(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Fire,
    Hidden,
    HistoricalDate,
    OutsideWindow,
}

/// Decides whether a scheduled tick turns into a trigger.
pub struct PollGate;

impl PollGate {
    pub fn evaluate(
        visible: bool,
        selected_date: NaiveDate,
        live_date: NaiveDate,
        in_intraday_window: bool,
    ) -> PollDecision {
        if !visible {
            PollDecision::Hidden
        } else if selected_date != live_date {
            PollDecision::HistoricalDate
        } else if !in_intraday_window {
            PollDecision::OutsideWindow
        } else {
            PollDecision::Fire
        }
    }
}

/// Calls `on_tick` every `period`, starting one period from now.
///
/// Ticks that fall behind are skipped rather than replayed in a burst.
/// Returns `None` when `period` is zero (polling disabled).
pub fn spawn_poller<F>(period: Duration, on_tick: F) -> Option<JoinHandle<()>>
where
    F: Fn() + Send + 'static,
{
    if period.is_zero() {
        debug!("Poller: disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            on_tick();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn test_gate_rejects_each_condition() {
        assert_eq!(
            PollGate::evaluate(false, date(10), date(10), true),
            PollDecision::Hidden
        );
        assert_eq!(
            PollGate::evaluate(true, date(9), date(10), true),
            PollDecision::HistoricalDate
        );
        assert_eq!(
            PollGate::evaluate(true, date(10), date(10), false),
            PollDecision::OutsideWindow
        );
        assert_eq!(
            PollGate::evaluate(true, date(10), date(10), true),
            PollDecision::Fire
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_ticks_each_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = spawn_poller(Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(160)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[test]
    fn test_zero_period_disables() {
        assert!(spawn_poller(Duration::ZERO, || {}).is_none());
    }
}
