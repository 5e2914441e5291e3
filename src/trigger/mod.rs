// src/trigger/mod.rs

//! Refresh intents.
//!
//! Every reason to refresh (a click, a debounced edit, a poll tick, a
//! parameter change) becomes a [`TriggerEvent`] with a fresh version from the
//! [`TriggerSequencer`]. A pipeline is only allowed to commit while its
//! version is still the latest one.

pub mod debounce;
pub mod poll;

pub use debounce::Debouncer;
pub use poll::{spawn_poller, PollDecision, PollGate, Visibility};

use crate::models::TriggerEvent;
use chrono::NaiveDate;

/// Monotonic version counter plus the latest issued event.
#[derive(Debug, Clone)]
pub struct TriggerSequencer {
    latest: TriggerEvent,
}

impl TriggerSequencer {
    /// Starts at version 1, issued for `today`, so the initial load runs
    /// without an explicit trigger.
    pub fn new(today: NaiveDate) -> Self {
        Self {
            latest: TriggerEvent {
                version: 1,
                issued_for_date: today,
            },
        }
    }

    /// Issues the next version. Every pipeline started for an older version
    /// is stale from this point on.
    pub fn record(&mut self, for_date: NaiveDate) -> TriggerEvent {
        self.latest = TriggerEvent {
            version: self.latest.version + 1,
            issued_for_date: for_date,
        };
        self.latest
    }

    pub fn latest(&self) -> TriggerEvent {
        self.latest
    }

    pub fn is_current(&self, version: u64) -> bool {
        self.latest.version == version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn test_starts_at_version_one() {
        let seq = TriggerSequencer::new(date(10));
        assert_eq!(
            seq.latest(),
            TriggerEvent {
                version: 1,
                issued_for_date: date(10)
            }
        );
    }

    #[test]
    fn test_record_is_strictly_increasing() {
        let mut seq = TriggerSequencer::new(date(10));
        let a = seq.record(date(10));
        let b = seq.record(date(9));
        assert!(b.version > a.version);
        assert_eq!(b.issued_for_date, date(9));
        assert!(seq.is_current(b.version));
        assert!(!seq.is_current(a.version));
    }
}
