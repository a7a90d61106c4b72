//! Date/time helpers: fixed UTC text form, durations, timezone conversion and
//! work windows.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

const UTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats an instant as `YYYY-MM-DD HH:MM:SS UTC`, the stored form for sessions.
pub fn format_utc(instant: DateTime<Utc>) -> String {
    format!("{} UTC", instant.format(UTC_FORMAT))
}

/// Parses `YYYY-MM-DD HH:MM:SS` with or without the trailing ` UTC`.
pub fn parse_utc(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    let raw = trimmed.strip_suffix("UTC").unwrap_or(trimmed).trim_end();
    NaiveDateTime::parse_from_str(raw, UTC_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Drops the sub-second part of an instant.
pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.with_nanosecond(0).unwrap_or(instant)
}

/// Formats milliseconds as `MM:SS`. Minutes are not wrapped at 60.
pub fn format_time(ms: i64) -> String {
    let total_secs = ms.abs() / 1000;
    format!("{:02}:{:02}", total_secs / 60, total_secs % 60)
}

/// Elapsed time between two instants as `MM:SS`, clamped at zero.
pub fn duration_string(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let ms = (end - start).num_milliseconds().max(0);
    format_time(ms)
}

/// Parses a `MM:SS` duration back into fractional minutes.
pub fn duration_minutes(text: &str) -> f64 {
    let mut parts = text.split(':').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    let minutes = parts.next().unwrap_or(0);
    let seconds = parts.next().unwrap_or(0);
    minutes as f64 + seconds as f64 / 60.0
}

/// Whole minutes covering `ms`, rounded up.
pub fn ceil_minutes(ms: i64) -> i64 {
    (ms + 59_999).div_euclid(60_000)
}

/// Parses a 24-hour `H:MM` or `HH:MM` time of day.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let (hh, mm) = raw.trim().split_once(':')?;
    if hh.is_empty() || hh.len() > 2 || mm.len() != 2 {
        return None;
    }
    if !hh.chars().chain(mm.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveTime::from_hms_opt(hh.parse().ok()?, mm.parse().ok()?, 0)
}

/// Resolves a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times that fall
/// into a DST gap are moved forward by an hour.
pub fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Next instant at which the wall clock in `tz` reads `time`.
///
/// If that time today is at or before `now`, tomorrow's occurrence is used.
pub fn next_occurrence(time: NaiveTime, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&tz).date_naive();
    let target = local_to_utc(today.and_time(time), tz)?;
    if target > now {
        return Some(target);
    }
    local_to_utc(today.succ_opt()?.and_time(time), tz)
}

/// Parses `YYYY-MM-DD HH:MM[:SS]` (a `T` separator also works) as wall time in `tz`.
pub fn parse_local_datetime(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let normalized = text.trim().replacen('T', " ", 1);
    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M"))
        .ok()?;
    local_to_utc(naive, tz)
}

/// Parses user-entered instants: a `UTC`-suffixed text is taken as UTC,
/// anything else as wall time in `tz`.
pub fn parse_instant(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if text.trim_end().ends_with("UTC") {
        parse_utc(text)
    } else {
        parse_local_datetime(text, tz)
    }
}

/// Formats an instant as `YYYY-MM-DD HH:MM:SS` wall time in `tz`.
pub fn format_in_tz(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format(UTC_FORMAT).to_string()
}

/// Calendar date of an instant as seen in `tz`.
pub fn date_in_tz(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Parses an IANA timezone name.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// The process timezone from `$TZ`, or UTC.
pub fn system_timezone() -> Tz {
    std::env::var("TZ")
        .ok()
        .and_then(|name| parse_timezone(name.trim_start_matches(':')))
        .unwrap_or(Tz::UTC)
}

/// A half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Parses `HH:MM-HH:MM`.
    pub fn parse(text: &str) -> Option<Self> {
        let (start, end) = text.split_once('-')?;
        let window = Self {
            start: parse_time_of_day(start)?,
            end: parse_time_of_day(end)?,
        };
        (window.start < window.end).then_some(window)
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time < self.end
    }
}

/// Time-of-day ranges in a fixed zone during which idle reminders may fire.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkWindows {
    pub timezone: Tz,
    pub windows: Vec<TimeWindow>,
}

impl Default for WorkWindows {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Paris,
            windows: ["09:30-13:00", "14:00-18:00"]
                .iter()
                .filter_map(|w| TimeWindow::parse(w))
                .collect(),
        }
    }
}

impl WorkWindows {
    /// Returns true if `instant` falls inside any window, judged in the
    /// configured zone at minute resolution.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone).time();
        let minute = local.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(local);
        self.windows.iter().any(|w| w.contains(minute))
    }
}
