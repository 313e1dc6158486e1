use chrono::Duration;
use chrono_tz::Tz;
use tracing::warn;

use availability_cell::services::interval::parse_timezone;

use crate::models::{School, SchoolSettings};

pub const DEFAULT_DAYS_AHEAD: i64 = 21;
pub const DEFAULT_INTERVAL_MINUTES: i64 = 30;
pub const DEFAULT_CANCEL_NOTICE_HOURS: i64 = 24;
pub const DEFAULT_TEACHER_BREAK_MINUTES: i64 = 15;

/// Effective scheduling parameters for one school.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulingSettings {
    pub days_ahead: i64,
    pub interval_minutes: i64,
    pub cancel_notice_hours: i64,
    pub teacher_break_minutes: i64,
    pub timezone: Tz,
}

impl SchedulingSettings {
    /// The one place defaults are applied. Absent or nonsensical values fall
    /// back rather than failing a batch run.
    pub fn resolve(school: &School, settings: Option<&SchoolSettings>, fallback_tz: Tz) -> Self {
        let timezone = parse_timezone(school.timezone.as_deref(), fallback_tz);
        if school.timezone.is_some() && Some(timezone.name()) != school.timezone.as_deref() {
            warn!("School {} has unknown timezone {:?}, using {}", school.id, school.timezone, timezone);
        }

        let pick = |value: Option<i64>, default: i64, min: i64, name: &str| match value {
            Some(v) if v >= min => v,
            Some(v) => {
                warn!("School {} has invalid {} = {}, using {}", school.id, name, v, default);
                default
            }
            None => default,
        };

        let s = settings.cloned().unwrap_or_default();

        Self {
            days_ahead: pick(s.days_ahead, DEFAULT_DAYS_AHEAD, 1, "days_ahead"),
            interval_minutes: pick(s.interval, DEFAULT_INTERVAL_MINUTES, 1, "interval"),
            cancel_notice_hours: pick(s.cancel_b4_hours, DEFAULT_CANCEL_NOTICE_HOURS, 0, "cancel_b4_hours"),
            teacher_break_minutes: pick(s.teacher_break, DEFAULT_TEACHER_BREAK_MINUTES, 0, "teacher_break"),
            timezone,
        }
    }

    pub fn cancel_notice(&self) -> Duration {
        Duration::hours(self.cancel_notice_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn school(timezone: Option<&str>) -> School {
        School {
            id: Uuid::new_v4(),
            name: "North".to_string(),
            location: None,
            timezone: timezone.map(str::to_string),
        }
    }

    #[test]
    fn missing_settings_take_defaults() {
        let resolved = SchedulingSettings::resolve(&school(None), None, Tz::Asia__Bangkok);
        assert_eq!(resolved.days_ahead, 21);
        assert_eq!(resolved.interval_minutes, 30);
        assert_eq!(resolved.cancel_notice_hours, 24);
        assert_eq!(resolved.teacher_break_minutes, 15);
        assert_eq!(resolved.timezone, Tz::Asia__Bangkok);
    }

    #[test]
    fn partial_settings_keep_given_values() {
        let s = school(Some("Europe/Berlin"));
        let settings = SchoolSettings {
            school_id: s.id,
            days_ahead: Some(7),
            interval: None,
            cancel_b4_hours: Some(0),
            teacher_break: Some(-5),
        };
        let resolved = SchedulingSettings::resolve(&s, Some(&settings), Tz::UTC);
        assert_eq!(resolved.days_ahead, 7);
        assert_eq!(resolved.interval_minutes, 30);
        assert_eq!(resolved.cancel_notice_hours, 0);
        assert_eq!(resolved.teacher_break_minutes, 15);
        assert_eq!(resolved.timezone, Tz::Europe__Berlin);
    }

    #[test]
    fn bogus_timezone_falls_back() {
        let resolved = SchedulingSettings::resolve(&school(Some("Nowhere/Land")), None, Tz::UTC);
        assert_eq!(resolved.timezone, Tz::UTC);
    }
}
