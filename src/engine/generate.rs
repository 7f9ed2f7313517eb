use chrono::{Datelike, NaiveDate, Weekday};
use ulid::Ulid;

use crate::limits::{MAX_YEAR, MIN_YEAR};
use crate::model::*;
use crate::time;

use super::EngineError;

/// Opening hours `[open, close)` for a weekday, or `None` when closed.
pub fn opening_hours(weekday: Weekday) -> Option<(u32, u32)> {
    match weekday {
        Weekday::Sun => None,
        Weekday::Sat => Some((9, 13)),
        _ => Some((8, 16)),
    }
}

/// Every day of `month` in `year`, or of the whole year when `month` is `None`.
pub fn days_in(year: i32, month: Option<u32>) -> Result<Vec<NaiveDate>, EngineError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(EngineError::Validation(format!("year out of range: {year}")));
    }
    let months: Vec<u32> = match month {
        Some(m) if (1..=12).contains(&m) => vec![m],
        Some(m) => return Err(EngineError::Validation(format!("month out of range: {m}"))),
        None => (1..=12).collect(),
    };

    let mut days = Vec::new();
    for m in months {
        let Some(mut day) = NaiveDate::from_ymd_opt(year, m, 1) else {
            continue;
        };
        while day.month0() + 1 == m {
            days.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    }
    Ok(days)
}

/// Enumerate the one-hour availability windows for a period. Pure.
pub fn generate_windows(year: i32, month: Option<u32>) -> Result<Vec<Span>, EngineError> {
    let mut spans = Vec::new();
    for day in days_in(year, month)? {
        let Some((open, close)) = opening_hours(time::weekday_of(day)) else {
            continue;
        };
        for hour in open..close {
            if let Some(start) = time::at(day, hour) {
                spans.push(Span::new(start, start + time::HOUR));
            }
        }
    }
    Ok(spans)
}

/// Fresh full-capacity view of a generated window.
pub fn available_slot(id: Ulid, span: Span, worker_count: u32) -> SlotView {
    let kind = if worker_count == 0 {
        SlotKind::FullyBooked
    } else {
        SlotKind::Available {
            remaining: worker_count,
        }
    };
    SlotView {
        id,
        title: window_title(worker_count, worker_count),
        start: span.start_label(),
        end: span.end_label(),
        kind,
        visibility: Visibility::Public,
    }
}

/// Pure generator: full-capacity slots for the period.
pub fn generate_slots(
    year: i32,
    month: Option<u32>,
    worker_count: u32,
) -> Result<Vec<SlotView>, EngineError> {
    Ok(generate_windows(year, month)?
        .into_iter()
        .map(|span| available_slot(Ulid::new(), span, worker_count))
        .collect())
}
