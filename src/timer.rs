//! Timer tick loop and the messages the engine sends to the presentation layer.

use crate::engine::TimerEngine;
use crate::idle::IdleReminder;
use crate::models::{PendingFinalize, TimerState};
use crate::time_util::format_time;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const APP_TITLE: &str = "Time Tracker";

/// Ticks between idle-reminder checks.
const IDLE_CHECK_EVERY_TICKS: u32 = 60;

/// Message sent from the engine to whoever renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerMessage {
    /// Displayed time or window title changed.
    StateChanged { text: String, title: String },
    /// A session was appended, edited or deleted.
    LogUpdated,
    /// A count-up stopped without a task; ask the user to name it.
    FinalizeNeeded(PendingFinalize),
    /// Play a chime and/or show a desktop notification.
    Alert(Alert),
    /// Sound was muted; stop any chime in progress.
    SoundMuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    CountdownOver,
    Reminder,
    AutoStopped,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub summary: String,
    pub body: String,
}

/// An alert with mute and permission settings already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub notice: Option<Notice>,
    pub chime: Option<Duration>,
}

/// Runs the tick loop until `running` is cleared, ticking every second.
pub fn run_timer_loop(
    engine: Arc<Mutex<TimerEngine>>,
    idle: IdleReminder,
    running: Arc<AtomicBool>,
) {
    let mut ticks: u32 = 0;

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        ticks = ticks.wrapping_add(1);

        let Ok(mut engine) = engine.lock() else {
            warn!("Engine lock poisoned, stopping tick loop");
            return;
        };

        if let Err(e) = engine.tick() {
            warn!(error = %e, "Tick failed");
        }

        if ticks % IDLE_CHECK_EVERY_TICKS == 0 {
            let status = idle.check(&mut engine);
            debug!(?status, "Idle check");
        }
    }
}

/// Formats the displayed time for the current state.
pub fn format_display(state: &TimerState, now: DateTime<Utc>) -> String {
    state
        .display_ms(now)
        .map(format_time)
        .unwrap_or_else(|| "00:00".to_string())
}

/// Formats the window title for the current state.
pub fn format_title(state: &TimerState, now: DateTime<Utc>) -> String {
    match state {
        TimerState::Idle => APP_TITLE.to_string(),
        TimerState::Countdown { .. } => format!("{} - {}", format_display(state, now), APP_TITLE),
        TimerState::CountUp { .. } => format!("↑{} - {}", format_display(state, now), APP_TITLE),
    }
}
