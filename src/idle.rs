//! Idle reminder: nudges the user to start a timer during work hours.

use crate::engine::TimerEngine;
use crate::time_util::{format_time, WorkWindows};
use chrono::Duration;
use std::fmt;

/// Default quiet period before an idle reminder.
pub const DEFAULT_IDLE_THRESHOLD_MINS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStatus {
    /// Reminders are off, muted, a timer is running, or it is outside work hours.
    Suppressed,
    /// Idle, but the threshold has not been reached yet.
    Waiting { remaining_ms: i64 },
    /// A reminder should be raised now.
    Due,
}

impl fmt::Display for IdleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suppressed => write!(f, "suppressed"),
            Self::Waiting { remaining_ms } => {
                write!(f, "next reminder in {}", format_time(*remaining_ms))
            }
            Self::Due => write!(f, "due"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdleReminder {
    windows: WorkWindows,
    threshold: Duration,
    enabled: bool,
}

impl Default for IdleReminder {
    fn default() -> Self {
        Self::new(
            WorkWindows::default(),
            Duration::minutes(DEFAULT_IDLE_THRESHOLD_MINS),
        )
    }
}

impl IdleReminder {
    pub fn new(windows: WorkWindows, threshold: Duration) -> Self {
        Self {
            windows,
            threshold,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn status(&self, engine: &TimerEngine) -> IdleStatus {
        if !self.enabled
            || engine.is_running()
            || engine.mutes().reminders
            || !self.windows.contains(engine.now())
        {
            return IdleStatus::Suppressed;
        }

        let remaining_ms = self.threshold.num_milliseconds() - engine.ms_since_last_activity();
        if remaining_ms > 0 {
            IdleStatus::Waiting { remaining_ms }
        } else {
            IdleStatus::Due
        }
    }

    /// Raises the idle reminder if it is due. Returns the status seen before
    /// acting on it.
    pub fn check(&self, engine: &mut TimerEngine) -> IdleStatus {
        let status = self.status(engine);
        if status == IdleStatus::Due {
            engine.raise_idle_reminder();
        }
        status
    }
}
