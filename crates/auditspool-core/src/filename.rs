//! Rotation granularity, rotation instants and spool filename expansion.
//!
//! All functions here are pure: callers pass the instant to use, so the
//! scheduler and tests agree on the same arithmetic.

use std::fmt::Write as _;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike, Utc};

/// Longest spool path accepted, in bytes.
pub const MAX_PATH_LEN: usize = 1024;

const MINUTES_PER_HOUR: u32 = 60;
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("filename pattern \"{0}\" contains an unsupported escape")]
    InvalidPattern(String),

    #[error("local time does not exist in the current time zone")]
    AmbiguousLocalTime,

    #[error("spool path is {0} bytes, limit is {MAX_PATH_LEN}")]
    TooLong(usize),
}

/// Truncates `time` to the granularity implied by `age_minutes`.
///
/// Seconds (and sub-seconds) are always cleared, minutes as well when the
/// age is at least an hour, hours as well when it is at least a day.
pub fn truncate_to_granularity(
    time: DateTime<Local>,
    age_minutes: u32,
) -> Result<DateTime<Local>, FilenameError> {
    let naive = time.naive_local();
    let minute = if age_minutes >= MINUTES_PER_HOUR { 0 } else { naive.minute() };
    let hour = if age_minutes >= MINUTES_PER_DAY { 0 } else { naive.hour() };

    let truncated = naive
        .date()
        .and_hms_opt(hour, minute, 0)
        .ok_or(FilenameError::AmbiguousLocalTime)?;
    from_local(truncated)
}

/// Smallest instant strictly after `truncate(now)` that is a multiple of
/// `age_minutes` counted in local time.
///
/// Returns `None` when time-based rotation is disabled.
pub fn next_rotation_instant(
    now: DateTime<Local>,
    age_minutes: u32,
) -> Result<Option<DateTime<Local>>, FilenameError> {
    if age_minutes == 0 {
        return Ok(None);
    }
    let interval = i64::from(age_minutes) * 60;
    let base = truncate_to_granularity(now, age_minutes)?;

    // Seconds since the epoch as read on a local wall clock.
    let local_secs = base.naive_local().and_utc().timestamp();
    let next_secs = local_secs - local_secs.rem_euclid(interval) + interval;

    let next = DateTime::<Utc>::from_timestamp(next_secs, 0)
        .ok_or(FilenameError::AmbiguousLocalTime)?
        .naive_utc();
    from_local(next).map(Some)
}

/// Expands `pattern` at `time` and joins it to `directory`.
pub fn expand_filename(
    directory: &str,
    pattern: &str,
    time: DateTime<Local>,
) -> Result<String, FilenameError> {
    let mut path = String::with_capacity(directory.len() + pattern.len() + 16);
    path.push_str(directory);
    path.push('/');
    write!(path, "{}", time.format(pattern))
        .map_err(|_| FilenameError::InvalidPattern(pattern.to_string()))?;

    if path.len() > MAX_PATH_LEN {
        return Err(FilenameError::TooLong(path.len()));
    }
    Ok(path)
}

/// Splits a path into everything before the file extension and the
/// extension itself (with its dot, possibly empty).
pub fn split_extension(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => path.split_at(name_start + dot),
        _ => (path, ""),
    }
}

/// Inserts `_<disambiguator>` before the extension of `path`.
pub fn with_size_suffix(path: &str, disambiguator: i64) -> String {
    let (stem, extension) = split_extension(path);
    format!("{stem}_{disambiguator}{extension}")
}

/// True when `current` was produced from the same time bucket as
/// `candidate`, i.e. it starts with the candidate's pre-extension part.
pub fn same_time_bucket(current: &str, candidate: &str) -> bool {
    let (stem, _) = split_extension(candidate);
    !current.is_empty() && current.starts_with(stem)
}

fn from_local(naive: NaiveDateTime) -> Result<DateTime<Local>, FilenameError> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or(FilenameError::AmbiguousLocalTime)
}
