//! Command parsing and dispatch onto the timer engine.

use crate::engine::{EngineError, StopOutcome, TimerEngine};
use crate::log_store::{LogError, SessionEdit};
use crate::models::{Session, TimerState};
use crate::persistence::DatabaseError;
use crate::report::{daily_minutes, export_csv, last_weekdays, render_chart, DateRange};
use crate::time_util::{
    date_in_tz, format_in_tz, local_to_utc, parse_instant, parse_time_of_day, parse_timezone,
};
use crate::timer::format_display;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use thiserror::Error;

/// Weekdays shown by the chart.
const CHART_DAYS: usize = 5;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a countdown for DURATION minutes (25) or until a time of day (15:21)
    Start {
        duration: String,
        /// What you are working on
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },
    /// Start counting up; the task is asked for when it stops
    Countup,
    /// Stop the running timer and log it
    Stop {
        /// Stop without logging
        #[arg(long)]
        discard: bool,
    },
    /// Set the task of the running timer
    Task {
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },
    /// Move the start of the running timer (HH:MM today, or YYYY-MM-DD HH:MM[:SS])
    Adjust {
        #[arg(required = true, num_args = 1..)]
        start: Vec<String>,
    },
    /// Show the running timer
    Status,
    /// Name a count-up that stopped without a task
    Finalize {
        task: Vec<String>,
        /// Drop it instead of logging it
        #[arg(long)]
        discard: bool,
    },
    /// List logged sessions
    List,
    /// Log a past session
    Add {
        task: String,
        /// YYYY-MM-DD HH:MM[:SS] in the display timezone, or with a UTC suffix
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Change a logged session
    Edit {
        id: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Delete a logged session
    Delete { id: String },
    /// Delete every logged session
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Mute or unmute sound, notifications or reminders (toggles without a state)
    Mute {
        #[arg(value_enum)]
        target: MuteTarget,
        #[arg(value_enum)]
        state: Option<Switch>,
    },
    /// Show or set the display timezone ("system" resets it)
    Tz { zone: Option<String> },
    /// Export the log as CSV
    Export {
        /// First start date to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last start date to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Minutes per day over the last five weekdays
    Chart,
    /// Run interactively, ticking every second
    Run,
    /// Leave interactive mode
    Quit,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteTarget {
    Sound,
    Notifications,
    Reminders,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

/// One line typed in interactive mode.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
pub struct Line {
    #[command(subcommand)]
    pub command: Command,
}

/// Result of handling a command.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResult {
    /// Text to show the user.
    Output(String),
    /// Switch to interactive mode.
    Interactive,
    /// User requested quit.
    Quit,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Invalid time '{0}', expected YYYY-MM-DD HH:MM[:SS] (add UTC for UTC)")]
    InvalidTime(String),
    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("Nothing to change; pass --task, --start or --end")]
    NothingToEdit,
    #[error("This deletes every session; run again with --yes")]
    ClearNotConfirmed,
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Splits an input line into words. Single or double quotes group words.
pub fn split_line(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err("Unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parses an interactive input line. Blank lines give `None`; usage errors
/// and help requests come back as the text to print.
pub fn parse_line(input: &str) -> Result<Option<Command>, String> {
    let words = split_line(input)?;
    if words.is_empty() {
        return Ok(None);
    }
    Line::try_parse_from(words)
        .map(|line| Some(line.command))
        .map_err(|e| e.render().to_string())
}

fn parse_time_arg(text: &str, tz: Tz) -> Result<DateTime<Utc>, AppError> {
    parse_instant(text, tz).ok_or_else(|| AppError::InvalidTime(text.to_string()))
}

/// A bare `HH:MM` means today in `tz`.
fn parse_start_arg(text: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    match parse_time_of_day(text) {
        Some(time) => local_to_utc(date_in_tz(now, tz).and_time(time), tz)
            .ok_or_else(|| AppError::InvalidTime(text.to_string())),
        None => parse_time_arg(text, tz),
    }
}

fn parse_date_arg(text: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::InvalidDate(text.to_string()))
}

/// Handles a command and updates the engine accordingly.
pub fn handle_command(engine: &mut TimerEngine, command: Command) -> Result<EventResult, AppError> {
    let tz = engine.display_tz();

    let output = match command {
        Command::Start { duration, task } => {
            let task = task.join(" ");
            engine.plan_countdown(&task, &duration, tz).map_err(EngineError::from)?;

            let mut lines = Vec::new();
            if let TimerState::CountUp { .. } = engine.state() {
                let outcome = engine.stop(true)?;
                lines.push(describe_stop(&outcome));
            }
            engine.start_countdown(&task, &duration, tz)?;
            if let TimerState::Countdown { task, end_at, .. } = engine.state() {
                lines.push(format!(
                    "Countdown started: {} (until {})",
                    task,
                    format_in_tz(*end_at, tz)
                ));
            }
            lines.join("\n")
        }
        Command::Countup => {
            let logged_before = engine.log().list().len();
            engine.start_count_up()?;

            let mut lines = Vec::new();
            let sessions = engine.log().list();
            if sessions.len() > logged_before {
                if let Some(handed_off) = sessions.last() {
                    lines.push(format!("Logged {} ({})", handed_off.task, handed_off.duration));
                }
            }
            lines.push(format!("Count-up started at {}", format_in_tz(engine.now(), tz)));
            lines.join("\n")
        }
        Command::Stop { discard } => describe_stop(&engine.stop(!discard)?),
        Command::Task { task } => {
            let label = task.join(" ");
            if engine.set_task(&label).map_err(EngineError::from)? {
                format!("Task set to: {}", label.trim())
            } else {
                "No timer running".to_string()
            }
        }
        Command::Adjust { start } => {
            let new_start = parse_start_arg(&start.join(" "), tz, engine.now())?;
            if engine.adjust_start(new_start)? {
                match engine.state() {
                    TimerState::Idle => format!(
                        "Start moved to {}; the timer has run its course",
                        format_in_tz(new_start, tz)
                    ),
                    _ => format!("Start moved to {}", format_in_tz(new_start, tz)),
                }
            } else {
                "No timer running".to_string()
            }
        }
        Command::Status => describe_status(engine, tz),
        Command::Finalize { task, discard } => {
            let mut lines = Vec::new();
            if discard {
                let dropped = engine.log().discard_pending()?;
                lines.push(format!(
                    "Pending count-up discarded ({} to {})",
                    dropped.start, dropped.end
                ));
            } else {
                let session = engine.log().commit_pending(&task.join(" "))?;
                lines.push(format!("Logged {} ({})", session.task, session.duration));
            }
            if let Some(next) = engine.log().pending() {
                lines.push(format!(
                    "Next to name: {} to {} (finalize <task>)",
                    next.start, next.end
                ));
            }
            lines.join("\n")
        }
        Command::List => describe_sessions(&engine.log().list(), tz),
        Command::Add { task, start, end } => {
            let start = parse_time_arg(&start, tz)?;
            let end = parse_time_arg(&end, tz)?;
            let session = engine.log().record(&task, start, end)?;
            format!("Added {} ({}) as {}", session.task, session.duration, session.id)
        }
        Command::Edit {
            id,
            task,
            start,
            end,
        } => {
            if task.is_none() && start.is_none() && end.is_none() {
                return Err(AppError::NothingToEdit);
            }
            let existing = engine
                .log()
                .get(&id)
                .ok_or_else(|| LogError::NotFound(id.clone()))?;
            let start = match start {
                Some(text) => parse_time_arg(&text, tz)?,
                None => existing
                    .start_at()
                    .ok_or_else(|| AppError::InvalidTime(existing.start.clone()))?,
            };
            let end = match end {
                Some(text) => parse_time_arg(&text, tz)?,
                None => existing
                    .end_at()
                    .ok_or_else(|| AppError::InvalidTime(existing.end.clone()))?,
            };
            let edit = SessionEdit {
                task: task.unwrap_or(existing.task),
                start,
                end,
            };
            let session = engine.log().update(&id, edit)?;
            format!("Updated {}: {} ({})", session.id, session.task, session.duration)
        }
        Command::Delete { id } => {
            let session = engine.log().delete(&id)?;
            format!("Deleted {} ({})", session.task, session.duration)
        }
        Command::Clear { yes } => {
            if !yes {
                return Err(AppError::ClearNotConfirmed);
            }
            engine.log().clear()?;
            "Log cleared".to_string()
        }
        Command::Mute { target, state } => {
            let mutes = engine.mutes();
            let (current, name) = match target {
                MuteTarget::Sound => (mutes.sound, "Sound"),
                MuteTarget::Notifications => (mutes.notifications, "Notifications"),
                MuteTarget::Reminders => (mutes.reminders, "Reminders"),
            };
            let muted = state.map_or(!current, |s| s == Switch::On);
            match target {
                MuteTarget::Sound => engine.set_mute_sound(muted),
                MuteTarget::Notifications => engine.set_mute_notifications(muted),
                MuteTarget::Reminders => engine.set_mute_reminders(muted),
            }
            format!("{} {}", name, if muted { "muted" } else { "unmuted" })
        }
        Command::Tz { zone } => {
            match zone.as_deref() {
                None => {}
                Some("system") => engine.set_display_tz(None)?,
                Some(name) => {
                    let zone = parse_timezone(name)
                        .ok_or_else(|| AppError::InvalidTimezone(name.to_string()))?;
                    engine.set_display_tz(Some(zone))?;
                }
            }
            format!("Display timezone: {}", engine.display_tz().name())
        }
        Command::Export { from, to, out } => {
            let range = match (from.as_deref(), to.as_deref()) {
                (None, None) => None,
                (from, to) => Some(DateRange {
                    from: from.map(parse_date_arg).transpose()?,
                    to: to.map(parse_date_arg).transpose()?,
                }),
            };
            let csv = export_csv(&engine.log().list(), range, tz);
            match out {
                Some(path) => {
                    std::fs::write(&path, &csv).map_err(|source| AppError::Write {
                        path: path.clone(),
                        source,
                    })?;
                    format!("Exported to {}", path.display())
                }
                None => csv.trim_end().to_string(),
            }
        }
        Command::Chart => {
            let today = date_in_tz(engine.now(), tz);
            let days = last_weekdays(today, CHART_DAYS);
            let totals = daily_minutes(&engine.log().list(), &days, tz);
            render_chart(&totals).trim_end().to_string()
        }
        Command::Run => return Ok(EventResult::Interactive),
        Command::Quit => return Ok(EventResult::Quit),
    };

    Ok(EventResult::Output(output))
}

fn describe_stop(outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::NotRunning => "No timer running".to_string(),
        StopOutcome::Discarded => "Timer stopped, session discarded".to_string(),
        StopOutcome::AlreadyLogged => "Timer stopped (session already logged)".to_string(),
        StopOutcome::Logged(session) => format!("Logged {} ({})", session.task, session.duration),
        StopOutcome::TooShort => "Timer stopped; too short to log".to_string(),
        StopOutcome::PendingFinalize(_) => "Count-up stopped without a task".to_string(),
    }
}

fn describe_status(engine: &TimerEngine, tz: Tz) -> String {
    let now = engine.now();
    let state = engine.state();
    let mut lines = Vec::new();

    match state {
        TimerState::Idle => lines.push("No timer running".to_string()),
        TimerState::Countdown { task, end_at, .. } => {
            lines.push(format!("Countdown: {}", task));
            lines.push(format!("Remaining: {}", format_display(state, now)));
            lines.push(format!("Ends at:   {}", format_in_tz(*end_at, tz)));
        }
        TimerState::CountUp {
            task, started_at, ..
        } => {
            let label = if task.is_empty() { "(no task yet)" } else { task.as_str() };
            lines.push(format!("Count-up: {}", label));
            lines.push(format!("Elapsed:  {}", format_display(state, now)));
            lines.push(format!("Started:  {}", format_in_tz(*started_at, tz)));
        }
    }

    let pending = engine.log().pending_all();
    if let Some(oldest) = pending.first() {
        lines.push(format!(
            "Waiting for a name: {} to {} (finalize <task>)",
            oldest.start, oldest.end
        ));
        if pending.len() > 1 {
            lines.push(format!("{} more count-ups waiting after it", pending.len() - 1));
        }
    }

    let mutes = engine.mutes();
    let muted: Vec<&str> = [
        (mutes.sound, "sound"),
        (mutes.notifications, "notifications"),
        (mutes.reminders, "reminders"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    if !muted.is_empty() {
        lines.push(format!("Muted: {}", muted.join(", ")));
    }

    lines.join("\n")
}

fn describe_sessions(sessions: &[Session], tz: Tz) -> String {
    if sessions.is_empty() {
        return "No sessions logged".to_string();
    }

    let mut lines = vec![format!(
        "{:<34}  {:>8}  {:<19}  {:<19}  Task  ({})",
        "ID",
        "Duration",
        "Start",
        "End",
        tz.name()
    )];
    for session in sessions {
        let local = |text: &str, at: Option<DateTime<Utc>>| {
            at.map(|at| format_in_tz(at, tz))
                .unwrap_or_else(|| text.to_string())
        };
        lines.push(format!(
            "{:<34}  {:>8}  {:<19}  {:<19}  {}",
            session.id,
            session.duration,
            local(&session.start, session.start_at()),
            local(&session.end, session.end_at()),
            session.task
        ));
    }
    lines.join("\n")
}
