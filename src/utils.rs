use chrono::{DateTime, Duration, DurationRound, FixedOffset, SecondsFormat};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

/// Parse a fixed UTC offset such as `+07:00`, `-0330`, `+7` or `UTC+7`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("UTC")
        .or_else(|| trimmed.strip_prefix("utc"))
        .unwrap_or(trimmed);
    let (sign, digits) = match body.as_bytes().first() {
        None => (1, "0"),
        Some(b'Z') if body == "Z" => (1, "0"),
        Some(b'+') => (1, &body[1..]),
        Some(b'-') => (-1, &body[1..]),
        _ => return Err(format!("UTC offset must start with '+' or '-': {}", trimmed)),
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("invalid hours in UTC offset: {}", trimmed))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("invalid minutes in UTC offset: {}", trimmed))?;
    if !(0..60).contains(&minutes) {
        return Err(format!("invalid minutes in UTC offset: {}", trimmed));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("UTC offset out of range: {}", trimmed))
}

/// Minute-granularity form used in range query parameters (`2025-06-01T12:00`).
pub fn format_minute(ts: DateTime<FixedOffset>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).format("%Y-%m-%dT%H:%M").to_string()
}

/// Storage form of a sample timestamp (`2025-06-01T12:00:00+07:00`).
///
/// Every stored value is rendered in the same offset, which keeps text
/// comparison in SQL chronological. Sub-second parts are kept as 3, 6 or 9
/// digits and only when non-zero; `+`, `-` and `Z` all sort before `.`, so a
/// whole second still orders before its fractions.
pub fn format_canonical(ts: DateTime<FixedOffset>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Parse a zoned timestamp; values without a UTC offset are rejected.
pub fn parse_zoned(raw: &str) -> Option<DateTime<FixedOffset>> {
    let s = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M%z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M%z"]
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
}

pub fn floor_to_minute(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}

/// Enforces a minimum spacing between consecutive outbound requests.
#[derive(Debug)]
pub struct Pacer {
    spacing: StdDuration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: StdDuration) -> Self {
        Pacer { spacing, last: None }
    }

    /// Sleep until `spacing` has passed since the previous call, then mark now.
    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.spacing {
                thread::sleep(self.spacing - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}
