//! Scheduling — autosave cadence, the hourly decay tick, the daily ceremony
//! window, and per-persona heartbeat eligibility.
//!
//! The tick loop calls into this every 100 ms; everything here is cheap
//! bookkeeping over `Instant`s plus pure time math that the tests can drive
//! with fixed clocks.

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use ei_state::schema::PersonaEntity;

/// How often the ceremony window is re-checked.
const CEREMONY_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct Scheduler {
    last_autosave: Instant,
    last_decay: Instant,
    last_ceremony_check: Instant,
}

impl Scheduler {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_autosave: now,
            last_decay: now,
            last_ceremony_check: now,
        }
    }

    /// True at most once per `interval`; resets its own clock when it fires.
    pub fn autosave_due(&mut self, interval: Duration) -> bool {
        if self.last_autosave.elapsed() >= interval {
            self.last_autosave = Instant::now();
            true
        } else {
            false
        }
    }

    /// Autosave failed — try again next tick window rather than waiting a
    /// full interval.
    pub fn autosave_retry_soon(&mut self, interval: Duration) {
        self.last_autosave = Instant::now() - interval + Duration::from_secs(5);
    }

    pub fn decay_due(&mut self, interval: Duration) -> bool {
        if self.last_decay.elapsed() >= interval {
            self.last_decay = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn ceremony_check_due(&mut self) -> bool {
        if self.last_ceremony_check.elapsed() >= CEREMONY_CHECK_INTERVAL {
            self.last_ceremony_check = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the daily ceremony should run now: the configured local time has
/// passed today and no ceremony has run today. Returns today's date string
/// (to be recorded as `last_ceremony_date`) when due.
pub fn ceremony_due(
    now: DateTime<Utc>,
    timezone: &str,
    ceremony_time: &str,
    last_ceremony_date: Option<&str>,
) -> Option<String> {
    let tz: Tz = timezone.parse().unwrap_or_else(|_| {
        warn!(timezone, "unrecognised timezone — falling back to UTC");
        chrono_tz::UTC
    });
    let local = now.with_timezone(&tz);
    let target = NaiveTime::parse_from_str(ceremony_time, "%H:%M").unwrap_or_else(|_| {
        warn!(ceremony_time, "bad ceremony time — falling back to 09:00");
        NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)
    });

    if local.time() < target {
        return None;
    }
    let today = local.format("%Y-%m-%d").to_string();
    if last_ceremony_date == Some(today.as_str()) {
        return None;
    }
    Some(today)
}

/// Per-persona heartbeat eligibility.
///
/// `last_activity` is the caller-computed max of the last message timestamp
/// and `last_heartbeat`; `processing` means the persona has work queued or
/// in flight; `awaiting_ceremony` blocks Ei while its daily confirmations
/// are unanswered.
pub fn heartbeat_eligible(
    persona: &PersonaEntity,
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    processing: bool,
    awaiting_ceremony: bool,
) -> bool {
    if persona.is_archived || !persona.is_dynamic || processing || awaiting_ceremony {
        return false;
    }
    if persona.is_paused {
        // An elapsed pause_until means the pause lapsed; the caller
        // unpauses on its next sweep, so stay quiet this round.
        return false;
    }
    let Some(last) = last_activity else {
        // Never any activity: nothing to follow up on.
        return false;
    };
    let idle_ms = (now - last).num_milliseconds().max(0) as u64;
    idle_ms >= persona.heartbeat_delay_ms
}

// ── Tests ─────────────────────────────────────────────────────────────────────
