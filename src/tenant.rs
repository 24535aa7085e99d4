use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Ms, Span};

/// Fallback operating window for shops without configured hours.
pub const DEFAULT_OPEN: (u32, u32) = (8, 0);
pub const DEFAULT_CLOSE: (u32, u32) = (18, 0);

pub const WEEKDAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

pub fn weekday_name(day: Weekday) -> &'static str {
    WEEKDAY_NAMES[day.num_days_from_monday() as usize]
}

/// One day's `{open, close}` pair, stored as raw `"HH:MM"` strings exactly
/// as clients submit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: String,
    pub close: String,
}

/// Per-weekday opening hours, keyed by lowercase weekday name. Absence of a
/// day means that day is unconstrained — shops without configured hours are
/// never blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpeningHours(pub HashMap<String, DayHours>);

impl OpeningHours {
    pub fn empty() -> Self {
        Self(HashMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn day(&self, weekday: Weekday) -> Option<&DayHours> {
        self.0.get(weekday_name(weekday))
    }

    /// Resolve the configured window for `date`, or None when the day is
    /// absent or its stored times are malformed (permissive policy: callers
    /// treat None as unconstrained).
    pub fn window_on(&self, date: NaiveDate) -> Option<Span> {
        let hours = self.day(date.weekday())?;
        let open = parse_hhmm(&hours.open)?;
        let close = parse_hhmm(&hours.close)?;
        if close <= open {
            return None; // malformed, treat as absent
        }
        Some(Span::new(at_time(date, open), at_time(date, close)))
    }
}

/// Strict validation, applied when hours are registered or updated (the
/// containment check stays lenient about whatever is already stored).
pub fn validate_opening_hours(hours: &OpeningHours) -> Result<(), String> {
    for (day, dh) in &hours.0 {
        if !WEEKDAY_NAMES.contains(&day.as_str()) {
            return Err(format!("unknown weekday: {day}"));
        }
        let open = parse_hhmm(&dh.open)
            .ok_or_else(|| format!("{day}: open is not a valid HH:MM time"))?;
        let close = parse_hhmm(&dh.close)
            .ok_or_else(|| format!("{day}: close is not a valid HH:MM time"))?;
        if close <= open {
            return Err(format!("{day}: close must be after open"));
        }
    }
    Ok(())
}

/// True iff `span` is contained in the shop's window for that date.
/// Boundary-inclusive on both ends: starting at open and ending at close
/// are both allowed. Absent or malformed hours are permissive.
pub fn within_opening_hours(hours: &OpeningHours, date: NaiveDate, span: &Span) -> bool {
    match hours.window_on(date) {
        Some(window) => window.contains_span(span),
        None => true,
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

fn at_time(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Instant at `h:m` UTC on `date`.
pub fn at(date: NaiveDate, h: u32, m: u32) -> Ms {
    let time = NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
    at_time(date, time)
}

/// Calendar date an instant falls on (UTC). Instants are range-checked
/// before they get here, so the epoch fallback is unreachable in practice.
pub fn date_of(ms: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// The day's operating window: configured hours if present for that
/// weekday, the 08:00–18:00 default otherwise.
pub fn operating_window(hours: Option<&OpeningHours>, date: NaiveDate) -> Span {
    if let Some(hours) = hours
        && let Some(window) = hours.window_on(date)
    {
        return window;
    }
    Span::new(
        at(date, DEFAULT_OPEN.0, DEFAULT_OPEN.1),
        at(date, DEFAULT_CLOSE.0, DEFAULT_CLOSE.1),
    )
}

/// The owning barbershop; scopes staff, services, and opening hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub id: Ulid,
    pub name: String,
    pub opening_hours: OpeningHours,
    pub created_at: Ms,
}
