use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::interval::{Span, TimeInterval};

// ==============================================================================
// WEEKLY AVAILABILITY
// ==============================================================================

/// Recurring window in which a teacher accepts lessons. `day` is ISO
/// numbering, 1 = Monday through 7 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub day: u8,
    pub start: NaiveTime,
    pub stop: NaiveTime,
    pub code: String,
}

impl WeeklyAvailability {
    pub fn applies_to(&self, date: NaiveDate) -> bool {
        date.weekday().number_from_monday() == self.day as u32
    }
}

pub fn weekday_from_iso(day: u8) -> Option<Weekday> {
    match day {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WeeklyChange {
    Create {
        day: u8,
        start: NaiveTime,
        stop: NaiveTime,
    },
    Update {
        code: String,
        day: u8,
        start: NaiveTime,
        stop: NaiveTime,
    },
    Delete {
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Applied,
    Rejected(String),
}

/// Result for one entry of a bulk weekly-availability request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyChangeResult {
    pub index: usize,
    pub code: Option<String>,
    #[serde(flatten)]
    pub outcome: ChangeOutcome,
}

impl WeeklyChangeResult {
    pub fn is_applied(&self) -> bool {
        self.outcome == ChangeOutcome::Applied
    }
}

// ==============================================================================
// EXCEPTIONS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailabilityException {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub stop: NaiveTime,
    pub code: String,
}

impl UnavailabilityException {
    /// Rows are validated on write, so a stored exception always has start < stop.
    pub fn interval(&self) -> Option<TimeInterval> {
        TimeInterval::new(self.date, self.start, self.stop).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewException {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

// ==============================================================================
// SLOT GENERATION
// ==============================================================================

/// Time a booked lesson occupies before the teacher's break is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<Span> for BookedSpan {
    fn from(span: Span) -> Self {
        Self { start: span.start, end: span.stop }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Inputs for one day and one availability window.
#[derive(Debug, Clone)]
pub struct SlotQuery<'a> {
    pub date: NaiveDate,
    pub timezone: Tz,
    pub window_start: NaiveTime,
    pub window_stop: NaiveTime,
    pub duration_minutes: i64,
    pub step_minutes: i64,
    pub gap_minutes: i64,
    pub unavailable: &'a [TimeInterval],
    pub booked: &'a [BookedSpan],
}

/// Everything slot generation needs to know about one teacher, loaded once
/// per planning run.
#[derive(Debug, Clone, Default)]
pub struct TeacherScheduleContext {
    pub teacher_id: Uuid,
    pub weekly: Vec<WeeklyAvailability>,
    pub exceptions: Vec<UnavailabilityException>,
    pub booked: Vec<BookedSpan>,
}

impl TeacherScheduleContext {
    /// Distinct `(start, stop)` windows for the weekday of `date`, in start order.
    pub fn windows_for(&self, date: NaiveDate) -> Vec<(NaiveTime, NaiveTime)> {
        let mut windows: Vec<(NaiveTime, NaiveTime)> = self
            .weekly
            .iter()
            .filter(|w| w.applies_to(date) && w.start < w.stop)
            .map(|w| (w.start, w.stop))
            .collect();
        windows.sort();
        windows.dedup();
        windows
    }

    pub fn exceptions_on(&self, date: NaiveDate) -> Vec<TimeInterval> {
        self.exceptions
            .iter()
            .filter(|e| e.date == date)
            .filter_map(|e| e.interval())
            .collect()
    }

    /// Whether `span` sits entirely inside one weekly window of its local date.
    pub fn covers(&self, tz: &Tz, span: &Span) -> bool {
        let date = crate::services::interval::local_date(tz, span.start);
        self.windows_for(date).into_iter().any(|(start, stop)| {
            TimeInterval::new(date, start, stop)
                .map(|window| window.anchor(tz).covers(span))
                .unwrap_or(false)
        })
    }

    /// Exceptions of `span`'s local date that overlap it.
    pub fn blocking_exceptions(&self, tz: &Tz, span: &Span) -> Vec<&UnavailabilityException> {
        let date = crate::services::interval::local_date(tz, span.start);
        self.exceptions
            .iter()
            .filter(|e| e.date == date)
            .filter(|e| {
                e.interval()
                    .map(|interval| interval.anchor(tz).overlaps(span))
                    .unwrap_or(false)
            })
            .collect()
    }
}
