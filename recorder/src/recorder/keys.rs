use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// File stem for a recording flushed at `at`.
/// e.g. "17-05-2024.09-03-07"
pub fn recording_stem<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%d-%m-%Y.%H-%M-%S").to_string()
}

/// Timestamp prefix used in event log lines.
/// e.g. "09:03:07 17-05-2024"
pub fn event_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%H:%M:%S %d-%m-%Y").to_string()
}

/// Pick a path under `dir` for `stem` that does not exist yet.
/// `ext` of `None` names a directory. Two flushes in the same second get
/// "-1", "-2", ... suffixes instead of overwriting each other.
pub fn unique_recording_path(dir: &Path, stem: &str, ext: Option<&str>) -> PathBuf {
    let name = |suffix: Option<u32>| {
        let base = match suffix {
            Some(n) => format!("{stem}-{n}"),
            None => stem.to_string(),
        };
        match ext {
            Some(ext) => dir.join(format!("{base}.{ext}")),
            None => dir.join(base),
        }
    };

    let mut candidate = name(None);
    let mut n = 1;
    while candidate.exists() {
        candidate = name(Some(n));
        n += 1;
    }
    candidate
}
