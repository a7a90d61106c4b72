//! Reports over the session log: CSV export and weekday totals.

use crate::models::Session;
use crate::time_util::{date_in_tz, duration_minutes};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use chrono_tz::Tz;
use std::fmt::Write as _;

pub const CSV_HEADER: &str = "Task,Duration,Start (UTC),End (UTC)";

/// Width of the longest bar in the text chart.
const CHART_WIDTH: usize = 40;

/// Inclusive range of calendar dates. Either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Quotes a CSV field if it contains a comma, quote or line break.
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Renders sessions as CSV in log order. With a range, only sessions whose
/// start date in `tz` falls inside it are included.
pub fn export_csv(sessions: &[Session], range: Option<DateRange>, tz: Tz) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for session in sessions {
        if let Some(range) = range {
            match session.start_at() {
                Some(start) if range.contains(date_in_tz(start, tz)) => {}
                _ => continue,
            }
        }
        let _ = writeln!(
            out,
            "{},{},{},{}",
            csv_escape(&session.task),
            csv_escape(&session.duration),
            csv_escape(&session.start),
            csv_escape(&session.end)
        );
    }

    out
}

/// The last `n` Monday-to-Friday dates ending at `today`, oldest first.
pub fn last_weekdays(today: NaiveDate, n: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n);
    let mut day = today;
    while days.len() < n {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
        match day.checked_sub_signed(Duration::days(1)) {
            Some(prev) => day = prev,
            None => break,
        }
    }
    days.reverse();
    days
}

/// Minutes logged on each of `days`, grouped by start date in `tz`.
pub fn daily_minutes(sessions: &[Session], days: &[NaiveDate], tz: Tz) -> Vec<(NaiveDate, f64)> {
    days.iter()
        .map(|day| {
            let total: f64 = sessions
                .iter()
                .filter(|s| s.start_at().map(|start| date_in_tz(start, tz)) == Some(*day))
                .map(|s| duration_minutes(&s.duration))
                .sum();
            (*day, total)
        })
        .collect()
}

/// Draws a horizontal bar chart, one row per day.
pub fn render_chart(totals: &[(NaiveDate, f64)]) -> String {
    let max = totals.iter().map(|(_, m)| *m).fold(0.0_f64, f64::max);
    let mut out = String::new();

    for (day, minutes) in totals {
        let width = if max > 0.0 {
            ((minutes / max) * CHART_WIDTH as f64).round() as usize
        } else {
            0
        };
        let _ = writeln!(
            out,
            "{}  {:<chart$} {:.0} min",
            day.format("%a %Y-%m-%d"),
            "█".repeat(width),
            minutes,
            chart = CHART_WIDTH
        );
    }

    out
}
