//! Human time expression parsing and rendering
//!
//! Converts strings like `"3 hours"`, `"90m"` or `"1h and 30m"` into a
//! duration in seconds, and renders durations back into the same grammar.

use crate::punishment::error::{PunishError, PunishResult};

/// Recognized unit families, largest first. Each entry carries the full,
/// abbreviated and single-letter spellings plus the unit length in seconds.
const UNIT_TABLE: &[(&[&str; 3], u64)] = &[
    (&["weeks", "wks", "w"], 60 * 60 * 24 * 7),
    (&["days", "dys", "d"], 60 * 60 * 24),
    (&["hours", "hrs", "h"], 60 * 60),
    (&["minutes", "mins", "m"], 60),
    (&["seconds", "secs", "s"], 1),
];

/// Upper bound on an accepted duration (100 years). Keeps expiries far
/// inside the representable chrono range.
pub const MAX_DURATION_SECONDS: u64 = 60 * 60 * 24 * 365 * 100;

/// Parse a free-form duration expression into whole seconds.
///
/// Bare numbers are interpreted as seconds. Unit names match
/// case-insensitively by prefix against the table above, in table order.
/// Commas and the word "and" act as separators, and number/unit pairs may
/// be concatenated ("1h30m").
///
/// # Errors
/// Returns [`PunishError::InvalidDurationFormat`] on empty input, unknown
/// unit names, numbers with more than one decimal point, or dangling
/// numbers/units.
pub fn parse_duration(input: &str) -> PunishResult<u64> {
    let cleaned = input.to_lowercase();
    let mut total = 0.0_f64;
    let mut pending: Option<f64> = None;
    let mut saw_unit = false;

    let chunks = cleaned
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty() && *s != "and");

    for chunk in chunks {
        for run in split_runs(chunk) {
            if run.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
                if pending.is_some() {
                    return Err(PunishError::InvalidDurationFormat(format!(
                        "number without a unit in {input:?}"
                    )));
                }
                pending = Some(parse_number(run, input)?);
            } else {
                let magnitude = pending.take().ok_or_else(|| {
                    PunishError::InvalidDurationFormat(format!("unit without a number in {input:?}"))
                })?;
                let unit_seconds = find_unit(run).ok_or_else(|| {
                    PunishError::InvalidDurationFormat(format!("unknown unit {run:?}"))
                })?;
                total += magnitude * unit_seconds as f64;
                saw_unit = true;
            }
        }
    }

    let seconds = match (pending, saw_unit) {
        // A lone number is a count of seconds
        (Some(n), false) => n.round() as u64,
        (Some(_), true) => {
            return Err(PunishError::InvalidDurationFormat(format!(
                "trailing number without a unit in {input:?}"
            )));
        }
        (None, true) => total.round() as u64,
        (None, false) => {
            return Err(PunishError::InvalidDurationFormat(
                "empty duration".to_string(),
            ));
        }
    };
    if seconds > MAX_DURATION_SECONDS {
        return Err(PunishError::InvalidDurationFormat(format!(
            "duration {input:?} exceeds the {} limit",
            render_duration(MAX_DURATION_SECONDS as i64, false)
        )));
    }
    Ok(seconds)
}

/// Render a duration in seconds back to text.
///
/// The long form joins non-final units with commas and the last with
/// "and" ("1 hour, 30 minutes and 10 seconds"); the short form
/// concatenates single-letter codes ("1h30m10s"). Negative durations
/// render as relative-past ("5 minutes ago"). For positive durations the
/// long form round-trips through [`parse_duration`].
#[must_use]
pub fn render_duration(seconds: i64, short: bool) -> String {
    let past = seconds < 0;
    let mut remaining = seconds.unsigned_abs();
    let mut parts: Vec<String> = Vec::new();

    for (names, unit_seconds) in UNIT_TABLE {
        let magnitude = remaining / unit_seconds;
        remaining %= unit_seconds;
        if magnitude > 0 {
            parts.push(render_unit(magnitude, names, short));
        }
    }

    let body = match parts.len() {
        0 => {
            if short {
                "0s".to_string()
            } else {
                "0 seconds".to_string()
            }
        }
        1 => parts.remove(0),
        _ if short => parts.concat(),
        _ => {
            let last = parts.pop().unwrap_or_default();
            format!("{} and {}", parts.join(", "), last)
        }
    };

    if past { format!("{body} ago") } else { body }
}

fn render_unit(magnitude: u64, names: &[&str; 3], short: bool) -> String {
    if short {
        format!("{magnitude}{}", names[2])
    } else {
        let name = if magnitude == 1 {
            names[0].trim_end_matches('s')
        } else {
            names[0]
        };
        format!("{magnitude} {name}")
    }
}

/// Split a chunk like "1h30m" into alternating digit and alpha runs.
fn split_runs(chunk: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut numeric = None;

    for (i, c) in chunk.char_indices() {
        let is_num = c.is_ascii_digit() || c == '.';
        if numeric.is_some_and(|n| n != is_num) {
            runs.push(&chunk[start..i]);
            start = i;
        }
        numeric = Some(is_num);
    }
    if start < chunk.len() {
        runs.push(&chunk[start..]);
    }
    runs
}

fn parse_number(run: &str, input: &str) -> PunishResult<f64> {
    if run.matches('.').count() > 1 {
        return Err(PunishError::InvalidDurationFormat(format!(
            "malformed number {run:?} in {input:?}"
        )));
    }
    run.parse::<f64>().map_err(|_| {
        PunishError::InvalidDurationFormat(format!("malformed number {run:?} in {input:?}"))
    })
}

fn find_unit(token: &str) -> Option<u64> {
    for (names, unit_seconds) in UNIT_TABLE {
        if names.iter().any(|name| name.starts_with(token)) {
            return Some(*unit_seconds);
        }
    }
    None
}
