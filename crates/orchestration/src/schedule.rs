//! When a job fires
//!
//! Fixed intervals and a daily wall-clock time (UTC) are the only primitives.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};

use crate::error::JobError;

/// Firing schedule of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every fixed interval, first firing one interval after registration.
    Every(Duration),
    /// Once a day at the given UTC time.
    DailyAt(NaiveTime),
    /// Only fires through `trigger_now`.
    Manual,
}

impl Schedule {
    /// Parse `"every 500ms"`, `"every 30s"`, `"every 5m"`, `"every 2h"`, `"daily 18:30"` or `"manual"`.
    pub fn parse(text: &str) -> Result<Self, JobError> {
        let text = text.trim();
        let invalid = || JobError::InvalidSchedule(text.to_string());

        if text.eq_ignore_ascii_case("manual") {
            return Ok(Schedule::Manual);
        }

        let (kind, arg) = text.split_once(char::is_whitespace).ok_or_else(invalid)?;
        let arg = arg.trim();
        match kind.to_ascii_lowercase().as_str() {
            "every" => {
                let (digits, millis_per_unit) = if let Some(v) = arg.strip_suffix("ms") {
                    (v, 1)
                } else if let Some(v) = arg.strip_suffix('s') {
                    (v, 1_000)
                } else if let Some(v) = arg.strip_suffix('m') {
                    (v, 60_000)
                } else if let Some(v) = arg.strip_suffix('h') {
                    (v, 3_600_000)
                } else {
                    return Err(invalid());
                };
                let value: u64 = digits.parse().map_err(|_| invalid())?;
                let millis = value.checked_mul(millis_per_unit).ok_or_else(invalid)?;
                if millis == 0 {
                    return Err(invalid());
                }
                Ok(Schedule::Every(Duration::from_millis(millis)))
            }
            "daily" => NaiveTime::parse_from_str(arg, "%H:%M")
                .map(Schedule::DailyAt)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            Schedule::Every(d) if d.is_zero() => Err(JobError::InvalidSchedule(
                "interval must be non-zero".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Time from `now` until the next firing, or `None` for manual jobs.
    ///
    /// A daily time equal to `now` is considered passed and rolls to tomorrow.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::DailyAt(at) => {
                let today = now.date_naive().and_time(*at).and_utc();
                let target = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (target - now).to_std().ok()
            }
            Schedule::Manual => None,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(d) => {
                let secs = d.as_secs();
                if secs > 0 && secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs > 0 && secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else if d.subsec_nanos() == 0 {
                    write!(f, "every {secs}s")
                } else {
                    write!(f, "every {}ms", d.as_millis())
                }
            }
            Schedule::DailyAt(at) => write!(f, "daily {}", at.format("%H:%M")),
            Schedule::Manual => f.write_str("manual"),
        }
    }
}
