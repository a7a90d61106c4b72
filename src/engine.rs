//! Timer engine: the countdown / count-up state machine, its recovery
//! snapshot, and the hand-off of finished sessions to the log.

use crate::clock::Clock;
use crate::log_store::{LogError, SessionLog};
use crate::models::{
    next_reminder_after, Mutes, PendingFinalize, Session, Snapshot, TimerMode, TimerState,
    COUNT_UP_CAP_MS, MAX_COUNTDOWN_MINS, REMINDER_INTERVAL_MS,
};
use crate::persistence::{keys, Database, DatabaseError};
use crate::time_util::{
    ceil_minutes, format_time, next_occurrence, parse_time_of_day, parse_timezone,
};
use crate::timer::{format_display, format_title, Alert, AlertKind, Notice, TimerMessage};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum time between periodic snapshot writes while ticking.
pub const PERSIST_EVERY_MS: i64 = 5000;

const COUNTDOWN_CHIME: StdDuration = StdDuration::from_secs(3);
const SHORT_CHIME: StdDuration = StdDuration::from_secs(1);

/// User-correctable input errors. The engine state is unchanged when one is returned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter a task")]
    EmptyTask,
    #[error("Invalid duration '{0}': enter minutes (e.g. 25) or a time (e.g. 15:21)")]
    InvalidDuration(String),
    #[error("Start time cannot be in the future")]
    StartInFuture,
    #[error("Start time is out of range")]
    StartOutOfRange,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Session log error: {0}")]
    Log(#[from] LogError),
}

/// What `stop` did with the session that was open.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// No timer was active.
    NotRunning,
    /// Stopped without logging.
    Discarded,
    /// The session had already been written to the log.
    AlreadyLogged,
    /// The session was appended to the log.
    Logged(Session),
    /// Under a second long; nothing was logged.
    TooShort,
    /// Count-up without a task; waiting for a name.
    PendingFinalize(PendingFinalize),
}

/// Owns the single active timer, the mute switches and the activity timestamp.
pub struct TimerEngine {
    state: TimerState,
    mutes: Mutes,
    notifications_permitted: bool,
    last_activity: DateTime<Utc>,
    last_persist: Option<DateTime<Utc>>,
    last_display: Option<(String, String)>,
    default_tz: Tz,
    db: Arc<Database>,
    log: SessionLog,
    clock: Box<dyn Clock>,
    tx: Sender<TimerMessage>,
}

impl TimerEngine {
    /// Creates an idle engine, loading mutes and the activity timestamp.
    /// Call [`TimerEngine::restore`] afterwards to resume a saved timer.
    pub fn new(db: Arc<Database>, clock: Box<dyn Clock>, tx: Sender<TimerMessage>) -> Self {
        let mutes = Mutes {
            sound: db.load(keys::MUTE_SOUND).unwrap_or(false),
            notifications: db.load(keys::MUTE_NOTIFICATIONS).unwrap_or(false),
            reminders: db.load(keys::MUTE_REMINDERS).unwrap_or(false),
        };
        let stored_activity = db
            .load::<i64>(keys::LAST_ACTIVITY)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let now = clock.now();
        let log = SessionLog::new(Arc::clone(&db), tx.clone());

        let mut engine = Self {
            state: TimerState::Idle,
            mutes,
            notifications_permitted: true,
            last_activity: stored_activity.unwrap_or(now),
            last_persist: None,
            last_display: None,
            default_tz: Tz::UTC,
            db,
            log,
            clock,
            tx,
        };
        if stored_activity.is_none() {
            engine.mark_activity();
        }
        engine
    }

    /// Sets the zone used when no display timezone has been stored.
    pub fn with_default_timezone(mut self, tz: Tz) -> Self {
        self.default_tz = tz;
        self
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn mutes(&self) -> Mutes {
        self.mutes
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// The stored display timezone, or the default one.
    pub fn display_tz(&self) -> Tz {
        self.db
            .load::<String>(keys::DISPLAY_TZ)
            .and_then(|name| parse_timezone(&name))
            .unwrap_or(self.default_tz)
    }

    /// Stores a display timezone; `None` reverts to the default.
    pub fn set_display_tz(&mut self, tz: Option<Tz>) -> Result<(), DatabaseError> {
        match tz {
            Some(tz) => self.db.save(keys::DISPLAY_TZ, tz.name()),
            None => self.db.remove(keys::DISPLAY_TZ),
        }
    }

    pub fn notifications_permitted(&self) -> bool {
        self.notifications_permitted
    }

    /// Without permission no desktop notifications are raised and count-up
    /// reminders are skipped.
    pub fn set_notifications_permitted(&mut self, permitted: bool) {
        self.notifications_permitted = permitted;
    }

    fn save_best_effort<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.db.save(key, value) {
            warn!(key, error = %e, "Failed to persist value");
        }
    }

    pub fn set_mute_sound(&mut self, muted: bool) {
        self.mutes.sound = muted;
        self.save_best_effort(keys::MUTE_SOUND, &muted);
        if muted {
            let _ = self.tx.send(TimerMessage::SoundMuted);
        }
    }

    pub fn set_mute_notifications(&mut self, muted: bool) {
        self.mutes.notifications = muted;
        self.save_best_effort(keys::MUTE_NOTIFICATIONS, &muted);
    }

    pub fn set_mute_reminders(&mut self, muted: bool) {
        self.mutes.reminders = muted;
        self.save_best_effort(keys::MUTE_REMINDERS, &muted);
    }

    /// Records an interaction with the timer controls.
    pub fn mark_activity(&mut self) {
        self.last_activity = self.clock.now();
        self.save_best_effort(keys::LAST_ACTIVITY, &self.last_activity.timestamp_millis());
    }

    pub fn ms_since_last_activity(&self) -> i64 {
        (self.clock.now() - self.last_activity).num_milliseconds()
    }

    /// Validates countdown input without starting anything. Returns the
    /// length in whole minutes and the deadline.
    pub fn plan_countdown(
        &self,
        task: &str,
        raw_duration: &str,
        tz: Tz,
    ) -> Result<(i64, DateTime<Utc>), ValidationError> {
        let now = self.clock.now();
        let raw = raw_duration.trim();
        let invalid = || ValidationError::InvalidDuration(raw.to_string());

        if task.trim().is_empty() {
            return Err(ValidationError::EmptyTask);
        }

        match parse_time_of_day(raw) {
            Some(time) => {
                let end_at = next_occurrence(time, tz, now).ok_or_else(invalid)?;
                let remaining = (end_at - now).num_milliseconds().max(0);
                Ok((ceil_minutes(remaining).max(1), end_at))
            }
            None => {
                let minutes = raw
                    .parse::<u32>()
                    .ok()
                    .filter(|m| (1..=MAX_COUNTDOWN_MINS).contains(&i64::from(*m)))
                    .ok_or_else(invalid)?;
                let end_at = now
                    .checked_add_signed(Duration::minutes(i64::from(minutes)))
                    .ok_or_else(invalid)?;
                Ok((i64::from(minutes), end_at))
            }
        }
    }

    /// Starts a countdown for `task`.
    ///
    /// `raw_duration` is either whole minutes (`25`) or a 24-hour time of day
    /// (`15:21`) in `tz`; a time that has already passed today means tomorrow.
    /// An open countdown is replaced without being logged.
    pub fn start_countdown(
        &mut self,
        task: &str,
        raw_duration: &str,
        tz: Tz,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let (duration_mins, end_at) = self.plan_countdown(task, raw_duration, tz)?;
        let task = task.trim();

        if let TimerState::CountUp { .. } = self.state {
            warn!("Countdown started over an open count-up; the count-up is dropped");
        }

        self.state = TimerState::Countdown {
            task: task.to_string(),
            started_at: now,
            end_at,
            duration_mins,
            logged: false,
        };
        info!(task, duration_mins, end_at = %end_at, "Countdown started");

        self.mark_activity();
        self.persist_snapshot();
        self.last_persist = Some(now);
        self.refresh_display(now);
        Ok(())
    }

    /// Starts a count-up with an empty task label.
    ///
    /// An open, unlogged countdown is logged first, ending now.
    pub fn start_count_up(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();

        if let TimerState::Countdown {
            task,
            started_at,
            end_at,
            logged: false,
            ..
        } = self.state.clone()
        {
            let outcome =
                self.finish_session(TimerMode::Countdown, &task, started_at, end_at.min(now))?;
            debug!(?outcome, "Countdown handed off to count-up");
            self.state.mark_logged();
        }

        self.state = TimerState::CountUp {
            task: String::new(),
            started_at: now,
            next_reminder_at: now + Duration::milliseconds(REMINDER_INTERVAL_MS),
            logged: false,
        };
        info!("Count-up started");

        self.mark_activity();
        self.persist_snapshot();
        self.last_persist = Some(now);
        self.refresh_display(now);
        Ok(())
    }

    /// Sets the task label of the running session. Returns false when idle.
    ///
    /// A countdown always keeps a task; clearing the label is only allowed on
    /// a count-up, where it means "ask for a name on stop".
    pub fn set_task(&mut self, label: &str) -> Result<bool, ValidationError> {
        let label = label.trim();
        match &mut self.state {
            TimerState::Idle => return Ok(false),
            TimerState::Countdown { .. } if label.is_empty() => {
                return Err(ValidationError::EmptyTask);
            }
            TimerState::Countdown { task, .. } | TimerState::CountUp { task, .. } => {
                *task = label.to_string();
            }
        }
        self.mark_activity();
        self.persist_snapshot();
        Ok(true)
    }

    /// Stops the active timer, logging the session when `should_log` is set.
    ///
    /// A count-up without a task is not logged; a pending-finalize record is
    /// stored and [`TimerMessage::FinalizeNeeded`] is sent instead.
    pub fn stop(&mut self, should_log: bool) -> Result<StopOutcome, EngineError> {
        let now = self.clock.now();

        let outcome = match self.state.clone() {
            TimerState::Idle => StopOutcome::NotRunning,
            _ if !should_log => StopOutcome::Discarded,
            state if state.is_logged() => StopOutcome::AlreadyLogged,
            TimerState::Countdown {
                task,
                started_at,
                end_at,
                ..
            } => self.finish_session(TimerMode::Countdown, &task, started_at, end_at.min(now))?,
            TimerState::CountUp {
                task, started_at, ..
            } => self.finish_session(TimerMode::CountUp, &task, started_at, now)?,
        };

        self.teardown(now);
        debug!(?outcome, "Timer stopped");
        Ok(outcome)
    }

    /// Moves the start of the active session to `new_start`.
    ///
    /// A countdown keeps its duration, so its deadline moves with the start.
    /// A count-up realigns its next reminder to the start. Boundaries are
    /// checked right away. Returns false when no timer is active.
    pub fn adjust_start(&mut self, new_start: DateTime<Utc>) -> Result<bool, EngineError> {
        if self.state.is_idle() {
            return Ok(false);
        }

        let now = self.clock.now();
        if new_start > now {
            return Err(ValidationError::StartInFuture.into());
        }

        match &mut self.state {
            TimerState::Idle => return Ok(false),
            TimerState::Countdown {
                started_at,
                end_at,
                duration_mins,
                ..
            } => {
                *end_at = Duration::try_minutes(*duration_mins)
                    .and_then(|length| new_start.checked_add_signed(length))
                    .ok_or(ValidationError::StartOutOfRange)?;
                *started_at = new_start;
            }
            TimerState::CountUp {
                started_at,
                next_reminder_at,
                ..
            } => {
                *next_reminder_at = next_reminder_after(new_start, now)
                    .ok_or(ValidationError::StartOutOfRange)?;
                *started_at = new_start;
            }
        }
        info!(start = %new_start, "Start time adjusted");

        self.persist_snapshot();
        self.mark_activity();
        self.refresh_display(now);
        self.check_boundaries(now)?;
        Ok(true)
    }

    /// Advances time-based state. Called once per second.
    pub fn tick(&mut self) -> Result<(), EngineError> {
        if self.state.is_idle() {
            return Ok(());
        }
        let now = self.clock.now();

        self.refresh_display(now);
        let persist_due = self
            .last_persist
            .map_or(true, |at| (now - at).num_milliseconds() >= PERSIST_EVERY_MS);
        if persist_due {
            self.persist_snapshot();
            self.last_persist = Some(now);
        }

        if let TimerState::CountUp {
            task,
            started_at,
            next_reminder_at,
            ..
        } = self.state.clone()
        {
            if self.reminders_allowed() && now >= next_reminder_at {
                let label = if task.trim().is_empty() {
                    "Unnamed"
                } else {
                    task.as_str()
                };
                let elapsed = format_time((now - started_at).num_milliseconds());
                self.alert(
                    AlertKind::Reminder,
                    "Timer still running",
                    format!("Task: {label} - {elapsed} elapsed"),
                    Some(SHORT_CHIME),
                );
                if let TimerState::CountUp {
                    next_reminder_at, ..
                } = &mut self.state
                {
                    *next_reminder_at += Duration::milliseconds(REMINDER_INTERVAL_MS);
                }
                self.persist_snapshot();
            }
        }

        self.check_boundaries(now)
    }

    /// Resumes the timer saved by a previous process, if any.
    pub fn restore(&mut self) -> Result<(), EngineError> {
        let Some(snapshot) = self.db.load::<Snapshot>(keys::ACTIVE_TIMER) else {
            if matches!(self.db.get_raw(keys::ACTIVE_TIMER), Ok(Some(_))) {
                self.discard_snapshot();
            }
            return Ok(());
        };

        let now = self.clock.now();
        let Some(state) = snapshot.into_state(now) else {
            warn!("Saved timer is incomplete, discarding it");
            self.discard_snapshot();
            return Ok(());
        };
        self.state = state;
        self.last_display = None;
        info!(mode = ?self.state.mode(), "Restored active timer");

        match self.state.clone() {
            TimerState::CountUp { started_at, .. }
                if (now - started_at).num_milliseconds() >= COUNT_UP_CAP_MS =>
            {
                self.alert_auto_stop();
                self.stop(true)?;
                return Ok(());
            }
            TimerState::Countdown {
                task,
                started_at,
                end_at,
                logged,
                ..
            } if now >= end_at => {
                if !logged {
                    self.finish_session(TimerMode::Countdown, &task, started_at, end_at)?;
                    self.state.mark_logged();
                }
                self.stop(false)?;
                return Ok(());
            }
            _ => {}
        }

        self.persist_snapshot();
        self.last_persist = Some(now);
        self.refresh_display(now);
        Ok(())
    }

    /// Raises the "no timer running" reminder and resets the activity timestamp.
    pub fn raise_idle_reminder(&mut self) {
        self.alert(
            AlertKind::Idle,
            "Reminder: no timer running",
            "Start a timer?".to_string(),
            None,
        );
        self.mark_activity();
    }

    fn reminders_allowed(&self) -> bool {
        !self.mutes.reminders && !self.mutes.notifications && self.notifications_permitted
    }

    fn check_boundaries(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        match self.state.clone() {
            TimerState::Countdown {
                task,
                started_at,
                end_at,
                logged: false,
                ..
            } if now >= end_at => {
                self.alert(
                    AlertKind::CountdownOver,
                    "Time is up!",
                    format!("Task: {task}"),
                    Some(COUNTDOWN_CHIME),
                );
                // Log at the deadline, not at the (possibly late) tick
                self.finish_session(TimerMode::Countdown, &task, started_at, end_at)?;
                self.state.mark_logged();
                self.stop(false)?;
            }
            TimerState::CountUp { started_at, .. }
                if (now - started_at).num_milliseconds() >= COUNT_UP_CAP_MS =>
            {
                self.alert_auto_stop();
                self.stop(true)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Logs a finished span. A count-up without a task is queued for naming
    /// instead; a countdown always goes to the log.
    fn finish_session(
        &mut self,
        mode: TimerMode,
        task: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StopOutcome, EngineError> {
        if mode == TimerMode::CountUp && task.trim().is_empty() {
            let pending = PendingFinalize::new(start, end);
            if pending.end_at() <= pending.start_at() {
                return Ok(StopOutcome::TooShort);
            }
            self.log.push_pending(&pending)?;
            info!(start = %pending.start, end = %pending.end, "Count-up needs a task name");
            let _ = self.tx.send(TimerMessage::FinalizeNeeded(pending.clone()));
            return Ok(StopOutcome::PendingFinalize(pending));
        }

        match self.log.record(task, start, end) {
            Ok(session) => {
                self.state.mark_logged();
                Ok(StopOutcome::Logged(session))
            }
            Err(LogError::EndNotAfterStart) => {
                info!(task, "Session too short to log");
                Ok(StopOutcome::TooShort)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn teardown(&mut self, now: DateTime<Utc>) {
        self.state = TimerState::Idle;
        self.last_persist = None;
        self.discard_snapshot();
        self.mark_activity();
        self.refresh_display(now);
    }

    fn persist_snapshot(&self) {
        match self.state.to_snapshot() {
            Some(snapshot) => self.save_best_effort(keys::ACTIVE_TIMER, &snapshot),
            None => self.discard_snapshot(),
        }
    }

    fn discard_snapshot(&self) {
        if let Err(e) = self.db.remove(keys::ACTIVE_TIMER) {
            warn!(error = %e, "Failed to delete saved timer");
        }
    }

    fn refresh_display(&mut self, now: DateTime<Utc>) {
        let display = (
            format_display(&self.state, now),
            format_title(&self.state, now),
        );
        if self.last_display.as_ref() != Some(&display) {
            let (text, title) = display.clone();
            self.last_display = Some(display);
            let _ = self.tx.send(TimerMessage::StateChanged { text, title });
        }
    }

    fn alert_auto_stop(&self) {
        self.alert(
            AlertKind::AutoStopped,
            "Count up reached 2 hours - stopped",
            "Session was auto-stopped and recorded.".to_string(),
            Some(SHORT_CHIME),
        );
    }

    fn alert(&self, kind: AlertKind, summary: &str, body: String, chime: Option<StdDuration>) {
        let notice = (!self.mutes.notifications && self.notifications_permitted).then(|| Notice {
            summary: summary.to_string(),
            body,
        });
        let chime = chime.filter(|_| !self.mutes.sound);
        if notice.is_none() && chime.is_none() {
            debug!(?kind, "Alert suppressed by mutes");
            return;
        }
        let _ = self.tx.send(TimerMessage::Alert(Alert {
            kind,
            notice,
            chime,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::mpsc::{self, Receiver};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    struct Harness {
        engine: TimerEngine,
        clock: ManualClock,
        db: Arc<Database>,
        rx: Receiver<TimerMessage>,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            Self::with(db, ManualClock::new(at(9, 0, 0)))
        }

        fn with(db: Arc<Database>, clock: ManualClock) -> Self {
            let (tx, rx) = mpsc::channel();
            let engine = TimerEngine::new(Arc::clone(&db), Box::new(clock.clone()), tx);
            Self {
                engine,
                clock,
                db,
                rx,
            }
        }

        /// Simulates a process restart: a fresh engine over the same storage.
        fn restart(self) -> Self {
            let Self { db, clock, .. } = self;
            let mut next = Self::with(db, clock);
            next.engine.restore().unwrap();
            next
        }

        fn advance(&self, secs: i64) {
            self.clock.advance(Duration::seconds(secs));
        }

        fn messages(&self) -> Vec<TimerMessage> {
            self.rx.try_iter().collect()
        }

        fn alerts(&self) -> Vec<Alert> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    TimerMessage::Alert(alert) => Some(alert),
                    _ => None,
                })
                .collect()
        }

        fn snapshot(&self) -> Option<Snapshot> {
            self.db.load(keys::ACTIVE_TIMER)
        }
    }

    #[test]
    fn test_engine_initial_state() {
        let h = Harness::new();
        assert!(h.engine.state().is_idle());
        assert!(!h.engine.is_running());
        assert_eq!(h.engine.mutes(), Mutes::default());
        assert_eq!(h.engine.last_activity(), at(9, 0, 0));
        assert_eq!(
            h.db.load::<i64>(keys::LAST_ACTIVITY),
            Some(at(9, 0, 0).timestamp_millis())
        );
    }

    #[test]
    fn test_start_countdown_validation() {
        let mut h = Harness::new();

        let cases = [
            ("", "25"),
            ("   ", "25"),
            ("Task", "0"),
            ("Task", "-5"),
            ("Task", "abc"),
            ("Task", "25x"),
            ("Task", "25:00"),
            ("Task", "10081"),
        ];
        for (task, duration) in cases {
            let result = h.engine.start_countdown(task, duration, Tz::UTC);
            assert!(
                matches!(result, Err(EngineError::Validation(_))),
                "{task:?} / {duration:?} should be rejected"
            );
        }

        assert!(h.engine.state().is_idle());
        assert_eq!(h.snapshot(), None);
    }

    #[test]
    fn test_start_countdown_empty_task_reported_first() {
        let mut h = Harness::new();
        let result = h.engine.start_countdown(" ", "abc", Tz::UTC);
        assert!(matches!(
            result,
            Err(EngineError::Validation(ValidationError::EmptyTask))
        ));
    }

    #[test]
    fn test_start_countdown_minutes() {
        let mut h = Harness::new();
        h.advance(30);
        h.engine
            .start_countdown("  Write report ", "25", Tz::UTC)
            .unwrap();

        assert_eq!(
            h.engine.state(),
            &TimerState::Countdown {
                task: "Write report".to_string(),
                started_at: at(9, 0, 30),
                end_at: at(9, 25, 30),
                duration_mins: 25,
                logged: false,
            }
        );
        assert_eq!(h.engine.last_activity(), at(9, 0, 30));

        let snapshot = h.snapshot().unwrap();
        assert_eq!(snapshot.mode, Some(TimerMode::Countdown));
        assert_eq!(snapshot.end_at, Some(at(9, 25, 30)));

        assert!(h.messages().contains(&TimerMessage::StateChanged {
            text: "25:00".to_string(),
            title: "25:00 - Time Tracker".to_string(),
        }));
    }

    #[test]
    fn test_start_countdown_time_of_day() {
        let mut h = Harness::new();
        h.clock.set(at(9, 0, 20));
        // Paris is UTC+1 in January, so 10:30 there is 09:30 UTC
        h.engine
            .start_countdown("Standup prep", "10:30", chrono_tz::Europe::Paris)
            .unwrap();

        match h.engine.state() {
            TimerState::Countdown {
                end_at,
                duration_mins,
                ..
            } => {
                assert_eq!(*end_at, at(9, 30, 0));
                assert_eq!(*duration_mins, 30);
            }
            other => panic!("Expected countdown, got {:?}", other),
        }
    }

    #[test]
    fn test_start_countdown_time_of_day_rolls_to_tomorrow() {
        let mut h = Harness::new();
        h.engine
            .start_countdown("Overnight", "08:59", Tz::UTC)
            .unwrap();

        match h.engine.state() {
            TimerState::Countdown {
                end_at,
                duration_mins,
                ..
            } => {
                assert_eq!(*end_at, at(8, 59, 0) + Duration::days(1));
                assert_eq!(*duration_mins, 23 * 60 + 59);
            }
            other => panic!("Expected countdown, got {:?}", other),
        }
    }

    #[test]
    fn test_start_then_stop_logs_one_session() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(10 * 60 + 5);

        let outcome = h.engine.stop(true).unwrap();
        let session = match outcome {
            StopOutcome::Logged(session) => session,
            other => panic!("Expected logged session, got {:?}", other),
        };

        assert_eq!(session.duration, "10:05");
        assert_eq!(session.start_at(), Some(at(9, 0, 0)));
        assert_eq!(session.end_at(), Some(at(9, 10, 5)));
        let elapsed = session.end_at().unwrap() - session.start_at().unwrap();
        assert_eq!(format_time(elapsed.num_milliseconds()), session.duration);

        assert_eq!(h.engine.log().list(), vec![session]);
        assert!(h.engine.state().is_idle());
        assert_eq!(h.snapshot(), None);
    }

    #[test]
    fn test_stop_twice_logs_once() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(60);

        assert!(matches!(h.engine.stop(true).unwrap(), StopOutcome::Logged(_)));
        assert_eq!(h.engine.stop(true).unwrap(), StopOutcome::NotRunning);
        assert_eq!(h.engine.log().list().len(), 1);
    }

    #[test]
    fn test_stop_without_logging() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(60);

        assert_eq!(h.engine.stop(false).unwrap(), StopOutcome::Discarded);
        assert!(h.engine.log().list().is_empty());
        assert_eq!(h.snapshot(), None);
        assert_eq!(h.engine.last_activity(), at(9, 1, 0));
    }

    #[test]
    fn test_countdown_expiry_logs_deadline_not_tick_time() {
        let mut h = Harness::new();
        h.engine.start_countdown("Short", "1", Tz::UTC).unwrap();
        h.messages();

        h.advance(30);
        h.engine.tick().unwrap();
        assert!(h.engine.is_running());

        // The tick arrives several seconds late
        h.advance(37);
        h.engine.tick().unwrap();

        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end_at(), Some(at(9, 1, 0)));
        assert_eq!(sessions[0].duration, "01:00");
        assert!(h.engine.state().is_idle());
        assert_eq!(h.snapshot(), None);

        let messages = h.messages();
        assert!(messages.contains(&TimerMessage::LogUpdated));
        let alert = messages
            .iter()
            .find_map(|m| match m {
                TimerMessage::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.kind, AlertKind::CountdownOver);
        assert_eq!(alert.chime, Some(COUNTDOWN_CHIME));
        assert_eq!(
            alert.notice,
            Some(Notice {
                summary: "Time is up!".to_string(),
                body: "Task: Short".to_string(),
            })
        );

        // Further ticks do nothing
        h.advance(5);
        h.engine.tick().unwrap();
        assert_eq!(h.engine.log().list().len(), 1);
    }

    #[test]
    fn test_countdown_alert_respects_mutes() {
        let mut h = Harness::new();
        h.engine.set_mute_sound(true);
        h.engine.start_countdown("Quiet", "1", Tz::UTC).unwrap();
        h.advance(60);
        h.engine.tick().unwrap();

        let alerts = h.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].chime, None);
        assert!(alerts[0].notice.is_some());

        h.engine.set_mute_notifications(true);
        h.engine.set_mute_sound(false);
        h.engine.start_countdown("Silent", "1", Tz::UTC).unwrap();
        h.advance(60);
        h.engine.tick().unwrap();

        let alerts = h.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].notice, None);
        assert_eq!(alerts[0].chime, Some(COUNTDOWN_CHIME));

        // Logging is never blocked by mutes
        assert_eq!(h.engine.log().list().len(), 2);
    }

    #[test]
    fn test_count_up_after_countdown_logs_both_in_order() {
        let mut h = Harness::new();
        h.engine.start_countdown("Countdown part", "25", Tz::UTC).unwrap();
        h.advance(5 * 60);

        h.engine.start_count_up().unwrap();
        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].task, "Countdown part");
        assert_eq!(sessions[0].end_at(), Some(at(9, 5, 0)));

        match h.engine.state() {
            TimerState::CountUp {
                task,
                started_at,
                next_reminder_at,
                logged,
            } => {
                assert!(task.is_empty());
                assert_eq!(*started_at, at(9, 5, 0));
                assert_eq!(*next_reminder_at, at(9, 25, 0));
                assert!(!logged);
            }
            other => panic!("Expected count-up, got {:?}", other),
        }

        h.advance(10 * 60);
        assert!(h.engine.set_task("Count-up part").unwrap());
        assert!(matches!(h.engine.stop(true).unwrap(), StopOutcome::Logged(_)));

        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].task, "Countdown part");
        assert_eq!(sessions[1].task, "Count-up part");
        assert_eq!(sessions[1].start_at(), Some(at(9, 5, 0)));
        assert_eq!(sessions[1].end_at(), Some(at(9, 15, 0)));
    }

    #[test]
    fn test_count_up_without_task_needs_finalize() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.advance(15 * 60);
        h.messages();

        let outcome = h.engine.stop(true).unwrap();
        let expected = PendingFinalize::new(at(9, 0, 0), at(9, 15, 0));
        assert_eq!(outcome, StopOutcome::PendingFinalize(expected.clone()));

        assert!(h.engine.log().list().is_empty());
        assert_eq!(h.engine.log().pending(), Some(expected.clone()));
        assert!(h
            .messages()
            .contains(&TimerMessage::FinalizeNeeded(expected)));

        let session = h.engine.log().commit_pending("Named afterwards").unwrap();
        assert_eq!(session.duration, "15:00");
        assert_eq!(h.engine.log().list().len(), 1);
    }

    #[test]
    fn test_second_unnamed_count_up_queues_behind_first() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.advance(30 * 60);
        h.engine.stop(true).unwrap();

        h.engine.start_count_up().unwrap();
        h.advance(10 * 60);
        h.engine.stop(true).unwrap();

        let first = PendingFinalize::new(at(9, 0, 0), at(9, 30, 0));
        let second = PendingFinalize::new(at(9, 30, 0), at(9, 40, 0));
        assert_eq!(h.engine.log().pending_all(), vec![first, second]);

        h.engine.log().commit_pending("Planning").unwrap();
        h.engine.log().commit_pending("Email").unwrap();
        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].task, "Planning");
        assert_eq!(sessions[0].duration, "30:00");
        assert_eq!(sessions[1].task, "Email");
        assert_eq!(sessions[1].duration, "10:00");
    }

    #[test]
    fn test_countdown_task_cannot_be_cleared() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(5 * 60);

        assert_eq!(h.engine.set_task(""), Err(ValidationError::EmptyTask));
        assert_eq!(h.engine.set_task("   "), Err(ValidationError::EmptyTask));
        assert_eq!(h.engine.state().task(), Some("Focus"));
        assert!(h.engine.set_task("Focus time").unwrap());

        match h.engine.stop(true).unwrap() {
            StopOutcome::Logged(session) => {
                assert_eq!(session.task, "Focus time");
                assert_eq!(session.end_at(), Some(at(9, 5, 0)));
            }
            other => panic!("Expected logged session, got {:?}", other),
        }
        assert_eq!(h.engine.log().pending(), None);
    }

    #[test]
    fn test_set_task_when_idle() {
        let mut h = Harness::new();
        assert_eq!(h.engine.set_task("Anything"), Ok(false));
        assert_eq!(h.engine.set_task(""), Ok(false));
    }

    #[test]
    fn test_count_up_stopped_immediately_is_too_short() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        assert_eq!(h.engine.stop(true).unwrap(), StopOutcome::TooShort);
        assert_eq!(h.engine.log().pending(), None);
        assert!(h.engine.state().is_idle());
    }

    #[test]
    fn test_adjust_start_when_idle() {
        let mut h = Harness::new();
        assert!(!h.engine.adjust_start(at(8, 0, 0)).unwrap());
    }

    #[test]
    fn test_adjust_start_rejects_future() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        let result = h.engine.adjust_start(at(9, 5, 0));
        assert!(matches!(
            result,
            Err(EngineError::Validation(ValidationError::StartInFuture))
        ));
        assert_eq!(h.engine.state().started_at(), Some(at(9, 0, 0)));
    }

    #[test]
    fn test_adjust_start_countdown_preserves_duration() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(10 * 60);

        assert!(h.engine.adjust_start(at(8, 50, 0)).unwrap());
        assert_eq!(
            h.engine.state(),
            &TimerState::Countdown {
                task: "Focus".to_string(),
                started_at: at(8, 50, 0),
                end_at: at(9, 15, 0),
                duration_mins: 25,
                logged: false,
            }
        );
        assert_eq!(h.snapshot().unwrap().end_at, Some(at(9, 15, 0)));
    }

    #[test]
    fn test_adjust_start_countdown_past_deadline_logs_immediately() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.advance(10 * 60);

        assert!(h.engine.adjust_start(at(8, 40, 0)).unwrap());

        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_at(), Some(at(8, 40, 0)));
        assert_eq!(sessions[0].end_at(), Some(at(9, 5, 0)));
        assert!(h.engine.state().is_idle());
    }

    #[test]
    fn test_adjust_start_count_up_realigns_reminder() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.advance(10 * 60);

        assert!(h.engine.adjust_start(at(8, 35, 0)).unwrap());
        match h.engine.state() {
            TimerState::CountUp {
                started_at,
                next_reminder_at,
                ..
            } => {
                assert_eq!(*started_at, at(8, 35, 0));
                assert_eq!(*next_reminder_at, at(9, 15, 0));
            }
            other => panic!("Expected count-up, got {:?}", other),
        }
    }

    #[test]
    fn test_adjust_start_count_up_on_reminder_boundary() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.advance(10 * 60);

        // Exactly two intervals have elapsed; the boundary at now is skipped
        assert!(h.engine.adjust_start(at(8, 30, 0)).unwrap());
        match h.engine.state() {
            TimerState::CountUp {
                next_reminder_at, ..
            } => assert_eq!(*next_reminder_at, at(9, 30, 0)),
            other => panic!("Expected count-up, got {:?}", other),
        }
    }

    #[test]
    fn test_adjust_start_count_up_past_cap_auto_stops_to_pending() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.advance(60);
        h.messages();

        assert!(h.engine.adjust_start(at(7, 1, 0)).unwrap());

        assert!(h.engine.state().is_idle());
        assert!(h.engine.log().list().is_empty());
        let expected = PendingFinalize::new(at(7, 1, 0), at(9, 1, 0));
        assert_eq!(h.engine.log().pending(), Some(expected.clone()));

        let messages = h.messages();
        assert!(messages.contains(&TimerMessage::FinalizeNeeded(expected)));
        assert!(messages.iter().any(|m| matches!(
            m,
            TimerMessage::Alert(Alert {
                kind: AlertKind::AutoStopped,
                ..
            })
        )));

        // The host restarts before the user answers, then names the session
        let h = h.restart();
        assert!(h.engine.state().is_idle());
        let session = h.engine.log().commit_pending("Recovered").unwrap();
        assert_eq!(session.start_at(), Some(at(7, 1, 0)));
        assert_eq!(session.end_at(), Some(at(9, 1, 0)));
        assert_eq!(h.engine.log().list(), vec![session]);
        assert_eq!(h.engine.log().pending(), None);
    }

    #[test]
    fn test_count_up_reminders_keep_cadence_and_cap_stops() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.messages();

        // First reminder fires a few seconds late
        h.clock.set(at(9, 20, 3));
        h.engine.tick().unwrap();
        let alerts = h.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Reminder);
        assert_eq!(
            alerts[0].notice.as_ref().map(|n| n.body.as_str()),
            Some("Task: Unnamed - 20:03 elapsed")
        );
        assert_eq!(alerts[0].chime, Some(SHORT_CHIME));
        match h.engine.state() {
            TimerState::CountUp {
                next_reminder_at, ..
            } => assert_eq!(*next_reminder_at, at(9, 40, 0)),
            other => panic!("Expected count-up, got {:?}", other),
        }
        assert_eq!(
            h.snapshot().unwrap().next_reminder_at,
            Some(at(9, 40, 0))
        );

        h.clock.set(at(9, 39, 59));
        h.engine.tick().unwrap();
        assert!(h.alerts().is_empty());

        h.clock.set(at(10, 59, 59));
        h.engine.tick().unwrap();
        assert!(h.engine.is_running());

        h.clock.set(at(11, 0, 0));
        h.engine.tick().unwrap();
        assert!(h.engine.state().is_idle());
        assert_eq!(
            h.engine.log().pending(),
            Some(PendingFinalize::new(at(9, 0, 0), at(11, 0, 0)))
        );
    }

    #[test]
    fn test_count_up_reminders_muted_or_not_permitted() {
        let mut h = Harness::new();
        h.engine.set_mute_reminders(true);
        h.engine.start_count_up().unwrap();
        h.clock.set(at(9, 20, 0));
        h.engine.tick().unwrap();
        assert!(h.alerts().is_empty());
        match h.engine.state() {
            TimerState::CountUp {
                next_reminder_at, ..
            } => assert_eq!(*next_reminder_at, at(9, 20, 0)),
            other => panic!("Expected count-up, got {:?}", other),
        }

        h.engine.set_mute_reminders(false);
        h.engine.set_notifications_permitted(false);
        h.clock.set(at(9, 21, 0));
        h.engine.tick().unwrap();
        assert!(h.alerts().is_empty());

        h.engine.set_notifications_permitted(true);
        h.clock.set(at(9, 22, 0));
        h.engine.tick().unwrap();
        assert_eq!(h.alerts().len(), 1);
    }

    #[test]
    fn test_restore_without_snapshot() {
        let h = Harness::new().restart();
        assert!(h.engine.state().is_idle());
    }

    #[test]
    fn test_restore_ignores_corrupt_snapshot() {
        let h = Harness::new();
        h.db.set_raw(keys::ACTIVE_TIMER, "{\"startMs\": \"soon\"").unwrap();
        let h = h.restart();
        assert!(h.engine.state().is_idle());
        assert_eq!(h.db.get_raw(keys::ACTIVE_TIMER).unwrap(), None);
    }

    #[test]
    fn test_restore_running_countdown() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        let before = h.engine.state().clone();
        h.advance(5 * 60);

        let h = h.restart();
        assert_eq!(h.engine.state(), &before);
        assert!(h.engine.log().list().is_empty());
    }

    #[test]
    fn test_restore_expired_countdown_logs_once() {
        let mut h = Harness::new();
        h.engine.start_countdown("Focus", "25", Tz::UTC).unwrap();
        h.clock.set(at(10, 0, 0));

        let mut h = h.restart();
        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end_at(), Some(at(9, 25, 0)));
        assert!(h.engine.state().is_idle());
        assert_eq!(h.snapshot(), None);

        h.engine.tick().unwrap();
        let h = h.restart();
        assert_eq!(h.engine.log().list().len(), 1);
    }

    #[test]
    fn test_restore_expired_countdown_already_logged() {
        let h = Harness::new();
        let snapshot = TimerState::Countdown {
            task: "Done".to_string(),
            started_at: at(8, 0, 0),
            end_at: at(8, 25, 0),
            duration_mins: 25,
            logged: true,
        }
        .to_snapshot()
        .unwrap();
        h.db.save(keys::ACTIVE_TIMER, &snapshot).unwrap();

        let h = h.restart();
        assert!(h.engine.state().is_idle());
        assert!(h.engine.log().list().is_empty());
        assert_eq!(h.snapshot(), None);
    }

    #[test]
    fn test_restore_count_up_recomputes_reminder() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.clock.set(at(9, 45, 0));

        let h = h.restart();
        match h.engine.state() {
            TimerState::CountUp {
                started_at,
                next_reminder_at,
                ..
            } => {
                assert_eq!(*started_at, at(9, 0, 0));
                assert_eq!(*next_reminder_at, at(10, 0, 0));
                assert!(*next_reminder_at > h.engine.now());
            }
            other => panic!("Expected count-up, got {:?}", other),
        }
        assert_eq!(
            h.snapshot().unwrap().next_reminder_at,
            Some(at(10, 0, 0))
        );
    }

    #[test]
    fn test_restore_count_up_on_reminder_boundary() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.clock.set(at(9, 40, 0));

        let h = h.restart();
        match h.engine.state() {
            TimerState::CountUp {
                next_reminder_at, ..
            } => assert_eq!(*next_reminder_at, at(10, 0, 0)),
            other => panic!("Expected count-up, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_discards_countdown_with_absurd_length() {
        let h = Harness::new();
        let start = at(8, 55, 0).timestamp_millis();
        h.db.set_raw(
            keys::ACTIVE_TIMER,
            &format!(
                r#"{{"task":"Focus","startMs":{start},"endMs":{},"mode":"down","durationMin":1000000000000000}}"#,
                start + 25 * 60_000
            ),
        )
        .unwrap();

        let mut h = h.restart();
        assert!(h.engine.state().is_idle());
        assert_eq!(h.db.get_raw(keys::ACTIVE_TIMER).unwrap(), None);
        assert!(!h.engine.adjust_start(at(8, 0, 0)).unwrap());
        assert!(h.engine.log().list().is_empty());
    }

    #[test]
    fn test_restore_count_up_past_cap() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        assert!(h.engine.set_task("Named").unwrap());
        h.clock.set(at(11, 30, 0));

        let h = h.restart();
        assert!(h.engine.state().is_idle());
        let sessions = h.engine.log().list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].task, "Named");
        assert_eq!(sessions[0].end_at(), Some(at(11, 30, 0)));
    }

    #[test]
    fn test_snapshot_persist_is_debounced() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.db.remove(keys::ACTIVE_TIMER).unwrap();

        h.advance(2);
        h.engine.tick().unwrap();
        assert_eq!(h.snapshot(), None);

        h.advance(3);
        h.engine.tick().unwrap();
        assert!(h.snapshot().is_some());
    }

    #[test]
    fn test_display_updates_only_on_change() {
        let mut h = Harness::new();
        h.engine.start_count_up().unwrap();
        h.messages();

        h.advance(1);
        h.engine.tick().unwrap();
        h.engine.tick().unwrap();

        let changes: Vec<_> = h
            .messages()
            .into_iter()
            .filter(|m| matches!(m, TimerMessage::StateChanged { .. }))
            .collect();
        assert_eq!(
            changes,
            vec![TimerMessage::StateChanged {
                text: "00:01".to_string(),
                title: "↑00:01 - Time Tracker".to_string(),
            }]
        );
    }

    #[test]
    fn test_mutes_persist_across_restart() {
        let mut h = Harness::new();
        h.engine.set_mute_sound(true);
        h.engine.set_mute_reminders(true);
        assert!(h.messages().contains(&TimerMessage::SoundMuted));

        let h = h.restart();
        assert_eq!(
            h.engine.mutes(),
            Mutes {
                sound: true,
                notifications: false,
                reminders: true,
            }
        );
    }

    #[test]
    fn test_activity_tracking() {
        let mut h = Harness::new();
        h.advance(90);
        assert_eq!(h.engine.ms_since_last_activity(), 90_000);

        h.engine.start_count_up().unwrap();
        assert_eq!(h.engine.ms_since_last_activity(), 0);

        h.advance(30);
        let h = h.restart();
        assert_eq!(h.engine.ms_since_last_activity(), 30_000);
    }

    #[test]
    fn test_idle_reminder_resets_activity() {
        let mut h = Harness::new();
        h.advance(25 * 60);
        h.engine.raise_idle_reminder();

        let alerts = h.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Idle);
        assert_eq!(alerts[0].chime, None);
        assert_eq!(h.engine.ms_since_last_activity(), 0);
    }

    #[test]
    fn test_display_timezone() {
        let mut h = Harness::new();
        assert_eq!(h.engine.display_tz(), Tz::UTC);

        h.engine
            .set_display_tz(Some(chrono_tz::Europe::Paris))
            .unwrap();
        assert_eq!(h.engine.display_tz(), chrono_tz::Europe::Paris);

        h.engine.set_display_tz(None).unwrap();
        let engine = h.engine.with_default_timezone(chrono_tz::Asia::Tokyo);
        assert_eq!(engine.display_tz(), chrono_tz::Asia::Tokyo);
    }
}
