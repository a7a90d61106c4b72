//! Data models for the time tracker.

use crate::time_util::{ceil_minutes, duration_string, format_utc, parse_utc, truncate_to_second};
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Interval between "timer still running" reminders during a count-up.
pub const REMINDER_INTERVAL_MS: i64 = 20 * 60 * 1000;
/// A count-up is stopped automatically once it has run this long.
pub const COUNT_UP_CAP_MS: i64 = 2 * 60 * 60 * 1000;
/// Longest countdown accepted, in minutes (one week).
pub const MAX_COUNTDOWN_MINS: i64 = 7 * 24 * 60;

/// The two kinds of active timer. Serialized as `"down"` / `"up"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerMode {
    #[serde(rename = "down")]
    Countdown,
    #[serde(rename = "up")]
    CountUp,
}

/// Timer state machine. Only the active variants carry a start instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TimerState {
    /// No active timer.
    #[default]
    Idle,
    /// Counting down to a fixed deadline.
    Countdown {
        task: String,
        started_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        /// Requested length, kept so the deadline can follow an edited start.
        duration_mins: i64,
        logged: bool,
    },
    /// Open-ended stopwatch. An empty task means "ask for a name on stop".
    CountUp {
        task: String,
        started_at: DateTime<Utc>,
        next_reminder_at: DateTime<Utc>,
        logged: bool,
    },
}

impl TimerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn mode(&self) -> Option<TimerMode> {
        match self {
            Self::Idle => None,
            Self::Countdown { .. } => Some(TimerMode::Countdown),
            Self::CountUp { .. } => Some(TimerMode::CountUp),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Idle => None,
            Self::Countdown { started_at, .. } | Self::CountUp { started_at, .. } => {
                Some(*started_at)
            }
        }
    }

    pub fn task(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Countdown { task, .. } | Self::CountUp { task, .. } => Some(task),
        }
    }

    /// Returns true if the current session has already been written to the log.
    pub fn is_logged(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Countdown { logged, .. } | Self::CountUp { logged, .. } => *logged,
        }
    }

    pub fn mark_logged(&mut self) {
        if let Self::Countdown { logged, .. } | Self::CountUp { logged, .. } = self {
            *logged = true;
        }
    }

    /// Milliseconds to show: remaining for a countdown, elapsed for a count-up.
    pub fn display_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        match self {
            Self::Idle => None,
            Self::Countdown { end_at, .. } => Some((*end_at - now).num_milliseconds().max(0)),
            Self::CountUp { started_at, .. } => {
                Some((now - *started_at).num_milliseconds().max(0))
            }
        }
    }

    /// Projection written to storage so a restarted process can resume.
    pub fn to_snapshot(&self) -> Option<Snapshot> {
        match self {
            Self::Idle => None,
            Self::Countdown {
                task,
                started_at,
                end_at,
                duration_mins,
                logged,
            } => Some(Snapshot {
                task: task.clone(),
                started_at: *started_at,
                end_at: Some(*end_at),
                has_logged: *logged,
                mode: Some(TimerMode::Countdown),
                next_reminder_at: None,
                duration_mins: Some(*duration_mins),
            }),
            Self::CountUp {
                task,
                started_at,
                next_reminder_at,
                logged,
            } => Some(Snapshot {
                task: task.clone(),
                started_at: *started_at,
                end_at: None,
                has_logged: *logged,
                mode: Some(TimerMode::CountUp),
                next_reminder_at: Some(*next_reminder_at),
                duration_mins: None,
            }),
        }
    }
}

/// First reminder boundary after `start` that lies strictly after `now`.
/// `None` if that instant is out of range.
pub fn next_reminder_after(start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let elapsed = (now - start).num_milliseconds();
    let intervals = if elapsed < 0 {
        1
    } else {
        elapsed.div_euclid(REMINDER_INTERVAL_MS) + 1
    };
    let offset = intervals.checked_mul(REMINDER_INTERVAL_MS)?;
    start.checked_add_signed(Duration::try_milliseconds(offset)?)
}

/// Recovery snapshot of the active timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub task: String,
    #[serde(rename = "startMs", with = "ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endMs", default, with = "ts_milliseconds_option")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(rename = "hasLogged", default)]
    pub has_logged: bool,
    #[serde(default)]
    pub mode: Option<TimerMode>,
    #[serde(rename = "nextReminderAt", default, with = "ts_milliseconds_option")]
    pub next_reminder_at: Option<DateTime<Utc>>,
    #[serde(rename = "durationMin", default)]
    pub duration_mins: Option<i64>,
}

impl Snapshot {
    /// Rebuilds the timer state.
    ///
    /// A missing mode is inferred from the presence of a deadline. A count-up
    /// whose next reminder is missing or not after `now` gets a fresh one.
    /// Returns `None` for values no running timer could have produced: a
    /// countdown without a task or deadline, a deadline before the start, a
    /// length outside `1..=MAX_COUNTDOWN_MINS`, or instants too close to the
    /// end of the representable range.
    pub fn into_state(self, now: DateTime<Utc>) -> Option<TimerState> {
        let mode = self.mode.unwrap_or(if self.end_at.is_some() {
            TimerMode::Countdown
        } else {
            TimerMode::CountUp
        });

        match mode {
            TimerMode::Countdown => {
                let end_at = self.end_at?;
                if self.task.trim().is_empty() || end_at < self.started_at {
                    return None;
                }
                let duration_mins = self.duration_mins.unwrap_or_else(|| {
                    ceil_minutes((end_at - self.started_at).num_milliseconds()).max(1)
                });
                if !(1..=MAX_COUNTDOWN_MINS).contains(&duration_mins) {
                    return None;
                }
                // Adjusting the start recomputes the deadline from the length
                self.started_at
                    .checked_add_signed(Duration::try_minutes(duration_mins)?)?;
                Some(TimerState::Countdown {
                    task: self.task,
                    started_at: self.started_at,
                    end_at,
                    duration_mins,
                    logged: self.has_logged,
                })
            }
            TimerMode::CountUp => {
                let next_reminder_at = match self.next_reminder_at {
                    Some(at) if at > now => at,
                    _ => next_reminder_after(self.started_at, now)?,
                };
                next_reminder_at.checked_add_signed(Duration::milliseconds(REMINDER_INTERVAL_MS))?;
                Some(TimerState::CountUp {
                    task: self.task,
                    started_at: self.started_at,
                    next_reminder_at,
                    logged: self.has_logged,
                })
            }
        }
    }
}

/// A completed session in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    pub task: String,
    pub duration: String,
    pub start: String,
    pub end: String,
}

impl Session {
    /// Builds an unsaved session. Both instants are truncated to whole
    /// seconds so the duration matches the stored texts exactly.
    pub fn new(task: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let start = truncate_to_second(start);
        let end = truncate_to_second(end);
        Self {
            id: String::new(),
            task: task.trim().to_string(),
            duration: duration_string(start, end),
            start: format_utc(start),
            end: format_utc(end),
        }
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.start)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.end)
    }
}

/// A count-up that stopped without a task and is waiting for a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFinalize {
    #[serde(rename = "startUTC")]
    pub start: String,
    #[serde(rename = "endUTC")]
    pub end: String,
}

impl PendingFinalize {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: format_utc(truncate_to_second(start)),
            end: format_utc(truncate_to_second(end)),
        }
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.start)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.end)
    }
}

/// Independent mute switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mutes {
    pub sound: bool,
    pub notifications: bool,
    pub reminders: bool,
}
