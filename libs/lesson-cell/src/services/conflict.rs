use chrono_tz::Tz;
use tracing::{debug, warn};
use uuid::Uuid;

use availability_cell::models::TeacherScheduleContext;
use availability_cell::services::interval::Span;
use shared_models::AppError;

use crate::models::Lesson;

/// Keeps a teacher's PENDING and CONFIRMED lessons pairwise disjoint.
pub struct ConflictGuard;

impl ConflictGuard {
    /// Fail if `candidate` overlaps any active lesson in `existing`, other
    /// than the lesson identified by `excluding`.
    pub fn assert_no_conflict(
        candidate: &Span,
        existing: &[Lesson],
        excluding: Option<Uuid>,
    ) -> Result<(), AppError> {
        let conflicts: Vec<&str> = existing
            .iter()
            .filter(|lesson| Some(lesson.id) != excluding)
            .filter(|lesson| lesson.status.is_active())
            .filter(|lesson| lesson.span().overlaps(candidate))
            .map(|lesson| lesson.code.as_str())
            .collect();

        if conflicts.is_empty() {
            debug!("No conflicts for {} - {}", candidate.start, candidate.stop);
            return Ok(());
        }

        warn!("Scheduling conflict with lessons {:?}", conflicts);
        Err(AppError::SchedulingConflict(format!(
            "overlaps existing lessons: {}",
            conflicts.join(", ")
        )))
    }

    /// Checks for a lesson entering PENDING: it must sit inside one of the
    /// teacher's weekly windows and clear of any exception that day.
    pub fn assert_within_availability(
        candidate: &Span,
        context: &TeacherScheduleContext,
        tz: &Tz,
    ) -> Result<(), AppError> {
        if !context.covers(tz, candidate) {
            return Err(AppError::SchedulingConflict(format!(
                "{} is outside the teacher's availability",
                candidate.start.with_timezone(tz).format("%Y-%m-%d %H:%M")
            )));
        }

        let blocking = context.blocking_exceptions(tz, candidate);
        if !blocking.is_empty() {
            let codes: Vec<&str> = blocking.iter().map(|e| e.code.as_str()).collect();
            return Err(AppError::SchedulingConflict(format!(
                "teacher is unavailable at that time ({})",
                codes.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{DateTime, TimeZone, Utc};

    use availability_cell::models::{UnavailabilityException, WeeklyAvailability};
    use shared_utils::test_utils::{date, time};

    use crate::models::LessonStatus;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date(2024, 5, 6).and_time(time(hour, minute)))
    }

    fn lesson(code: &str, start: DateTime<Utc>, minutes: i64, status: LessonStatus) -> Lesson {
        Lesson {
            id: Uuid::new_v4(),
            code: code.to_string(),
            school_id: Uuid::nil(),
            course_id: Uuid::nil(),
            teacher_id: Some(Uuid::nil()),
            start,
            end: start + chrono::Duration::minutes(minutes),
            status,
            number_of_client: 1,
            notified: false,
        }
    }

    #[test]
    fn confirmed_overlap_is_a_conflict() {
        let existing = vec![lesson("CONFIRMED001", at(10, 0), 60, LessonStatus::Confirmed)];
        let candidate = Span::starting_at(at(10, 30), 60);

        let result = ConflictGuard::assert_no_conflict(&candidate, &existing, None);
        assert_matches!(result, Err(AppError::SchedulingConflict(msg)) if msg.contains("CONFIRMED001"));
    }

    #[test]
    fn inactive_lessons_and_touching_edges_are_fine() {
        let existing = vec![
            lesson("AVAILABLE001", at(10, 0), 60, LessonStatus::Available),
            lesson("CANCELED0001", at(10, 0), 60, LessonStatus::Canceled),
            lesson("PENDING00001", at(11, 0), 60, LessonStatus::Pending),
        ];
        let candidate = Span::starting_at(at(10, 0), 60);

        assert!(ConflictGuard::assert_no_conflict(&candidate, &existing, None).is_ok());
    }

    #[test]
    fn lesson_does_not_conflict_with_itself() {
        let existing = vec![lesson("PENDING00001", at(9, 0), 60, LessonStatus::Pending)];
        let candidate = existing[0].span();

        assert!(ConflictGuard::assert_no_conflict(&candidate, &existing, Some(existing[0].id)).is_ok());
    }

    fn context() -> TeacherScheduleContext {
        let teacher_id = Uuid::new_v4();
        TeacherScheduleContext {
            teacher_id,
            weekly: vec![WeeklyAvailability {
                id: Uuid::new_v4(),
                teacher_id,
                day: 1,
                start: time(9, 0),
                stop: time(12, 0),
                code: "weekly000001".to_string(),
            }],
            exceptions: vec![UnavailabilityException {
                id: Uuid::new_v4(),
                teacher_id,
                date: date(2024, 5, 6),
                start: time(11, 0),
                stop: time(11, 30),
                code: "except000001".to_string(),
            }],
            booked: vec![],
        }
    }

    #[test]
    fn pending_candidate_must_sit_inside_a_window() {
        let ctx = context();
        assert!(ConflictGuard::assert_within_availability(&Span::starting_at(at(9, 0), 60), &ctx, &Tz::UTC).is_ok());
        assert_matches!(
            ConflictGuard::assert_within_availability(&Span::starting_at(at(8, 30), 60), &ctx, &Tz::UTC),
            Err(AppError::SchedulingConflict(_))
        );
    }

    #[test]
    fn pending_candidate_must_avoid_exceptions() {
        let ctx = context();
        assert_matches!(
            ConflictGuard::assert_within_availability(&Span::starting_at(at(10, 30), 60), &ctx, &Tz::UTC),
            Err(AppError::SchedulingConflict(msg)) if msg.contains("except000001")
        );
    }
}
