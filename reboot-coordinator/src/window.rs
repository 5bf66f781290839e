//! Reboot-window evaluator (spec §4.3). A window is a periodic schedule
//! (cron expression) paired with a duration; `inside_now` answers whether
//! the given instant falls inside the most recent occurrence of that
//! schedule.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::util::Error;

/// How far back we're willing to search for the schedule's previous
/// firing. A year comfortably covers any sane cron expression (including
/// ones that only fire a few times a year) without scanning forever.
const LOOKBACK: chrono::Duration = chrono::Duration::days(366);

#[derive(Clone)]
pub enum RebootWindow {
    /// No window configured: admission is never time-gated.
    Unbounded,
    Bounded { schedule: Schedule, length: Duration },
}

impl RebootWindow {
    /// Builds a window from the paired `(start, length)` configuration.
    /// Both must be present together or neither (spec §3/§6); a malformed
    /// expression or non-positive length is a fatal configuration error.
    pub fn parse(start: Option<&str>, length: Option<Duration>) -> Result<RebootWindow, Error> {
        match (start, length) {
            (None, None) => Ok(RebootWindow::Unbounded),
            (Some(_), None) | (None, Some(_)) => Err(Error::Config(
                "reboot-window-start and reboot-window-length must be set together".to_string(),
            )),
            (Some(start), Some(length)) => {
                if length.is_zero() {
                    return Err(Error::Config("reboot-window-length must be positive".to_string()));
                }
                let schedule = Schedule::from_str(start)
                    .map_err(|e| Error::Config(format!("invalid reboot-window-start {start:?}: {e}")))?;
                Ok(RebootWindow::Bounded { schedule, length })
            }
        }
    }

    pub fn inside_now(&self, now: DateTime<Utc>) -> bool {
        match self {
            RebootWindow::Unbounded => true,
            RebootWindow::Bounded { length, .. } => match self.previous_start(now) {
                Some(start) => now < start + chrono::Duration::from_std(*length).unwrap_or(chrono::Duration::zero()),
                None => false,
            },
        }
    }

    /// The next instant at or after `after` when the window opens.
    pub fn next_start(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RebootWindow::Unbounded => Some(after),
            RebootWindow::Bounded { schedule, .. } => schedule.after(&after).next(),
        }
    }

    fn previous_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RebootWindow::Unbounded => Some(now),
            RebootWindow::Bounded { schedule, .. } => schedule
                .after(&(now - LOOKBACK))
                .take_while(|t| *t <= now)
                .last(),
        }
    }
}
