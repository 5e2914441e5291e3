// src/clock/mod.rs

//! Exchange-local time.
//!
//! Every "today" and "is the market open" decision in the client goes through
//! [`ExchangeClock`], which reads the instant from a [`Clock`] and projects it
//! into the exchange timezone. The viewer's own timezone never leaks in.

use crate::traits::{Clock, SharedClock};
use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use log::warn;
use std::sync::{Arc, Mutex};

pub const DEFAULT_EXCHANGE_TZ: &str = "Asia/Seoul";

// =============================================================================
// Clocks
// =============================================================================

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and replay tools.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Trading Window
// =============================================================================

/// Inclusive intraday window in minutes since exchange-local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl Default for TradingWindow {
    /// 09:05 to 15:20.
    fn default() -> Self {
        Self {
            start_minute: 9 * 60 + 5,
            end_minute: 15 * 60 + 20,
        }
    }
}

impl TradingWindow {
    /// Parses `"HH:MM"` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let start_minute = parse_hhmm(start)?;
        let end_minute = parse_hhmm(end)?;
        if start_minute > end_minute {
            return Err(format!(
                "intraday window start {} is after end {}",
                start, end
            ));
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        (self.start_minute..=self.end_minute).contains(&minute_of_day)
    }
}

fn parse_hhmm(raw: &str) -> Result<u32, String> {
    let (h, m) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("invalid time '{}', expected HH:MM", raw))?;
    let h: u32 = h
        .parse()
        .map_err(|_| format!("invalid hour in '{}'", raw))?;
    let m: u32 = m
        .parse()
        .map_err(|_| format!("invalid minute in '{}'", raw))?;
    if h > 23 || m > 59 {
        return Err(format!("time '{}' out of range", raw));
    }
    Ok(h * 60 + m)
}

// =============================================================================
// Exchange Clock
// =============================================================================

/// Calendar and time-of-day as seen from the exchange.
#[derive(Clone)]
pub struct ExchangeClock {
    zone: Option<Tz>,
    window: TradingWindow,
    clock: SharedClock,
}

impl ExchangeClock {
    /// An unparsable zone name degrades to the system local timezone.
    pub fn new(zone_name: &str, window: TradingWindow, clock: SharedClock) -> Self {
        let zone = match zone_name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(e) => {
                warn!(
                    "ExchangeClock: timezone '{}' unavailable ({}), using system local time",
                    zone_name, e
                );
                None
            }
        };
        Self {
            zone,
            window,
            clock,
        }
    }

    pub fn seoul(clock: SharedClock) -> Self {
        Self::new(DEFAULT_EXCHANGE_TZ, TradingWindow::default(), clock)
    }

    pub fn window(&self) -> TradingWindow {
        self.window
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.date_at(self.clock.now())
    }

    pub fn now_minutes_of_day(&self) -> u32 {
        self.minutes_of_day_at(self.clock.now())
    }

    pub fn is_intraday_window(&self) -> bool {
        self.is_intraday_window_at(self.clock.now())
    }

    pub fn date_at(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self.zone {
            Some(tz) => instant.with_timezone(&tz).date_naive(),
            None => instant.with_timezone(&Local).date_naive(),
        }
    }

    pub fn minutes_of_day_at(&self, instant: DateTime<Utc>) -> u32 {
        let (h, m) = match self.zone {
            Some(tz) => {
                let t = instant.with_timezone(&tz);
                (t.hour(), t.minute())
            }
            None => {
                let t = instant.with_timezone(&Local);
                (t.hour(), t.minute())
            }
        };
        h * 60 + m
    }

    pub fn is_intraday_window_at(&self, instant: DateTime<Utc>) -> bool {
        self.window.contains(self.minutes_of_day_at(instant))
    }
}

// =============================================================================
// Tests
// =============================================================================
