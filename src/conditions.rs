//! Rule-guard evaluation.
//!
//! A rule's conditions are AND-ed predicates over the agent's environment
//! and the current UTC wall clock. The caller supplies the instant, so the
//! evaluation itself is pure and tests can pin any point in time.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::proto::{Environment, RuleConditions, TimeRange};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// True when every present predicate passes. Absent conditions always pass.
pub fn evaluate(
    conditions: Option<&RuleConditions>,
    environment: Environment,
    now: DateTime<Utc>,
) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };

    if let Some(envs) = &conditions.env {
        if !envs.iter().any(|e| e.eq_ignore_ascii_case(environment.as_str())) {
            return false;
        }
    }

    if let Some(range) = &conditions.time_range {
        if !within_time_range(range, now) {
            return false;
        }
    }

    if let Some(days) = &conditions.day_of_week {
        let today = DAY_NAMES[now.weekday().num_days_from_monday() as usize];
        if !days.iter().any(|d| d.eq_ignore_ascii_case(today)) {
            return false;
        }
    }

    true
}

/// Inclusive on both ends. When end < start the window wraps midnight, so
/// 22:00-06:00 admits 23:30 and 05:00 but not 12:00.
fn within_time_range(range: &TimeRange, now: DateTime<Utc>) -> bool {
    let current = now.hour() * 60 + now.minute();
    let start = parse_hhmm(&range.start, 0);
    let end = parse_hhmm(&range.end, 23 * 60 + 59);

    if end < start {
        current >= start || current <= end
    } else {
        (start..=end).contains(&current)
    }
}

fn parse_hhmm(value: &str, default: u32) -> u32 {
    let mut parts = value.split(':');
    let hour = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minute = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (hour, minute) {
        (Some(h), Some(m)) if h < 24 && m < 60 => h * 60 + m,
        _ => default,
    }
}
