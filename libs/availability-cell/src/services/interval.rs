use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use shared_models::AppError;

/// Wall-clock interval on a calendar date, interpreted in a school's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    date: NaiveDate,
    start: NaiveTime,
    stop: NaiveTime,
}

impl TimeInterval {
    pub fn new(date: NaiveDate, start: NaiveTime, stop: NaiveTime) -> Result<Self, AppError> {
        if start >= stop {
            return Err(AppError::Validation(format!(
                "interval start {} must be before stop {}",
                start.format("%H:%M"),
                stop.format("%H:%M"),
            )));
        }
        Ok(Self { date, start, stop })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn stop(&self) -> NaiveTime {
        self.stop
    }

    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.date == other.date && self.start < other.stop && other.start < self.stop
    }

    /// Overlapping or sharing an endpoint.
    pub fn touches(&self, other: &TimeInterval) -> bool {
        self.date == other.date && self.start <= other.stop && other.start <= self.stop
    }

    pub fn union(&self, other: &TimeInterval) -> TimeInterval {
        TimeInterval {
            date: self.date,
            start: self.start.min(other.start),
            stop: self.stop.max(other.stop),
        }
    }

    pub fn anchor(&self, tz: &Tz) -> Span {
        Span {
            start: localize(tz, self.date, self.start),
            stop: localize(tz, self.date, self.stop),
        }
    }
}

/// Half-open `[start, stop)` range of absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self { start, stop }
    }

    pub fn starting_at(start: DateTime<Utc>, minutes: i64) -> Self {
        Self {
            start,
            stop: start + Duration::minutes(minutes),
        }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.stop && other.start < self.stop
    }

    pub fn contains_instant(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.stop
    }

    pub fn covers(&self, other: &Span) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }

    pub fn extended_by(&self, minutes: i64) -> Span {
        Span {
            start: self.start,
            stop: self.stop + Duration::minutes(minutes),
        }
    }
}

/// Resolve a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (clocks falling back) take the earlier instant. Times in a
/// spring-forward gap are read with the pre-transition offset, which lands
/// them on the first valid instant after the gap.
pub fn localize(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let before = tz.offset_from_utc_datetime(&(naive - Duration::days(1))).fix();
            let utc = naive - Duration::seconds(before.local_minus_utc() as i64);
            Utc.from_utc_datetime(&utc)
        }
    }
}

/// Calendar date of `instant` in `tz`.
pub fn local_date(tz: &Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(tz).date_naive()
}

pub fn parse_timezone(name: Option<&str>, fallback: Tz) -> Tz {
    name.and_then(|n| n.parse::<Tz>().ok()).unwrap_or(fallback)
}

/// Sort and merge overlapping or adjacent spans into a disjoint list.
pub fn coalesce(mut spans: Vec<Span>) -> Vec<Span> {
    spans.retain(|s| !s.is_empty());
    spans.sort_by_key(|s| (s.start, s.stop));

    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.stop => {
                if span.stop > last.stop {
                    last.stop = span.stop;
                }
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// True when `candidate` overlaps none of `blocked`, which must be coalesced.
pub fn is_clear(blocked: &[Span], candidate: &Span) -> bool {
    let idx = blocked.partition_point(|b| b.start <= candidate.start);

    if idx > 0 && blocked[idx - 1].stop > candidate.start {
        return false;
    }
    if idx < blocked.len() && blocked[idx].start < candidate.stop {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_utils::test_utils::{date, time};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date(2024, 5, 6).and_time(time(hour, minute)))
    }

    #[test]
    fn interval_rejects_inverted_bounds() {
        assert!(TimeInterval::new(date(2024, 5, 6), time(10, 0), time(9, 0)).is_err());
        assert!(TimeInterval::new(date(2024, 5, 6), time(10, 0), time(10, 0)).is_err());
    }

    #[test]
    fn half_open_spans_do_not_overlap_at_boundary() {
        let first = Span::new(at(9, 0), at(10, 0));
        let second = Span::new(at(10, 0), at(11, 0));
        assert!(!first.overlaps(&second));
        assert!(first.contains_instant(at(9, 0)));
        assert!(!first.contains_instant(at(10, 0)));
    }

    #[test]
    fn coalesce_merges_overlapping_and_adjacent() {
        let spans = vec![
            Span::new(at(13, 0), at(14, 0)),
            Span::new(at(9, 0), at(10, 0)),
            Span::new(at(9, 30), at(11, 0)),
            Span::new(at(11, 0), at(11, 30)),
        ];
        let merged = coalesce(spans);
        assert_eq!(merged, vec![Span::new(at(9, 0), at(11, 30)), Span::new(at(13, 0), at(14, 0))]);
    }

    #[test]
    fn is_clear_checks_both_neighbours() {
        let blocked = coalesce(vec![Span::new(at(9, 0), at(10, 0)), Span::new(at(12, 0), at(13, 0))]);
        assert!(is_clear(&blocked, &Span::new(at(10, 0), at(11, 0))));
        assert!(!is_clear(&blocked, &Span::new(at(9, 30), at(10, 30))));
        assert!(!is_clear(&blocked, &Span::new(at(11, 30), at(12, 30))));
        // A candidate swallowing a whole blocked span is rejected too.
        assert!(!is_clear(&blocked, &Span::new(at(8, 0), at(14, 0))));
    }

    #[test]
    fn localize_moves_gap_times_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 02:30 does not exist on 2024-03-10; 03:30 EDT is 07:30 UTC.
        let instant = localize(&tz, date(2024, 3, 10), time(2, 30));
        assert_eq!(instant, Utc.from_utc_datetime(&date(2024, 3, 10).and_time(time(7, 30))));
    }

    #[test]
    fn localize_takes_earliest_ambiguous_instant() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 01:30 happens twice on 2024-11-03; the EDT reading is 05:30 UTC.
        let instant = localize(&tz, date(2024, 11, 3), time(1, 30));
        assert_eq!(instant, Utc.from_utc_datetime(&date(2024, 11, 3).and_time(time(5, 30))));
    }

    #[test]
    fn unknown_timezone_uses_fallback() {
        assert_eq!(parse_timezone(Some("Mars/Olympus"), Tz::Asia__Bangkok), Tz::Asia__Bangkok);
        assert_eq!(parse_timezone(Some("Europe/Paris"), Tz::Asia__Bangkok), Tz::Europe__Paris);
        assert_eq!(parse_timezone(None, Tz::UTC), Tz::UTC);
    }
}
