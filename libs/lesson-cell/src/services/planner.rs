use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use futures::future::try_join_all;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use availability_cell::models::{BookedSpan, SlotQuery, TeacherScheduleContext};
use availability_cell::services::interval::{local_date, localize, Span};
use availability_cell::{compute_available_slots, AvailabilityService, AvailabilityStore};
use shared_models::AppError;
use shared_utils::codes::{CodeGenerator, CODE_LENGTH};

use crate::models::{
    Course, CourseRegistration, Facility, Lesson, LessonStatus, PaymentStatus, PlannedLesson,
    PlannerReport, RegistrationPlan, School,
};
use crate::services::settings::SchedulingSettings;
use crate::store::LessonStore;

/// Days `[today, today + days_ahead)` in the school's zone, with the UTC
/// range they cover.
struct Horizon {
    days: Vec<NaiveDate>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl Horizon {
    fn starting(now: DateTime<Utc>, settings: &SchedulingSettings) -> Self {
        let tz = &settings.timezone;
        let today = local_date(tz, now);
        let days: Vec<NaiveDate> = (0..settings.days_ahead as u64)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .collect();
        let end = today
            .checked_add_days(Days::new(settings.days_ahead as u64))
            .unwrap_or(today);

        Self {
            from: localize(tz, today, NaiveTime::MIN),
            to: localize(tz, end, NaiveTime::MIN),
            days,
        }
    }

    fn first(&self) -> Option<NaiveDate> {
        self.days.first().copied()
    }

    fn last(&self) -> Option<NaiveDate> {
        self.days.last().copied()
    }
}

/// Running per-day record of occupied rooms. A span is filed under every
/// local day it touches. With no facilities the school has no ceiling.
struct CapacityCeiling {
    capacity: Option<i64>,
    tz: Tz,
    by_day: HashMap<NaiveDate, Vec<Span>>,
}

impl CapacityCeiling {
    fn new(facilities: &[Facility], tz: Tz) -> Self {
        let capacity = if facilities.is_empty() {
            None
        } else {
            Some(facilities.iter().map(|f| f.capacity.max(0)).sum())
        };
        Self {
            capacity,
            tz,
            by_day: HashMap::new(),
        }
    }

    fn admits(&self, span: &Span) -> bool {
        let Some(capacity) = self.capacity else {
            return true;
        };
        let first = local_date(&self.tz, span.start);

        // An overlapping span is counted on the later of the two first days,
        // which both spans touch.
        let overlapping: usize = self
            .days_touched(span)
            .into_iter()
            .filter_map(|day| self.by_day.get(&day).map(|spans| (day, spans)))
            .map(|(day, spans)| {
                let upper = spans.partition_point(|s| s.start < span.stop);
                spans[..upper]
                    .iter()
                    .filter(|s| s.stop > span.start)
                    .filter(|s| local_date(&self.tz, s.start).max(first) == day)
                    .count()
            })
            .sum();
        (overlapping as i64) < capacity
    }

    fn accept(&mut self, span: Span) {
        for day in self.days_touched(&span) {
            let spans = self.by_day.entry(day).or_default();
            let at = spans.partition_point(|s| s.start <= span.start);
            spans.insert(at, span);
        }
    }

    fn days_touched(&self, span: &Span) -> Vec<NaiveDate> {
        let first = local_date(&self.tz, span.start);
        let last = if span.stop > span.start {
            local_date(&self.tz, span.stop - chrono::Duration::nanoseconds(1))
        } else {
            first
        };
        first.iter_days().take_while(|day| *day <= last).collect()
    }
}

/// Projects bookable lessons over each school's planning horizon.
pub struct PlannerService {
    store: Arc<dyn LessonStore>,
    availability: AvailabilityService,
    fallback_tz: Tz,
}

impl PlannerService {
    pub fn new(store: Arc<dyn LessonStore>, availability_store: Arc<dyn AvailabilityStore>, fallback_tz: Tz) -> Self {
        Self {
            store,
            availability: AvailabilityService::new(availability_store),
            fallback_tz,
        }
    }

    // ==========================================================================
    // SPECULATIVE MODE
    // ==========================================================================

    pub async fn generate_upcoming(&self, school_id: Uuid) -> Result<PlannerReport, AppError> {
        self.generate_upcoming_at(school_id, Utc::now()).await
    }

    /// Replace the school's AVAILABLE lessons in the horizon with a fresh
    /// projection of every teacher's open slots.
    #[instrument(skip(self))]
    pub async fn generate_upcoming_at(&self, school_id: Uuid, now: DateTime<Utc>) -> Result<PlannerReport, AppError> {
        let school = self.school(school_id).await?;
        let settings = self.settings_for(&school).await?;
        let horizon = Horizon::starting(now, &settings);

        let mut report = PlannerReport {
            school_id,
            ..PlannerReport::default()
        };
        let (Some(first_day), Some(last_day)) = (horizon.first(), horizon.last()) else {
            return Ok(report);
        };

        let teachers = self.store.teachers(school_id).await?;
        let teacher_ids: Vec<Uuid> = teachers.iter().map(|t| t.id).collect();
        report.cleared = self
            .store
            .delete_available_lessons(&teacher_ids, horizon.from, horizon.to)
            .await?;

        let courses: Vec<Course> = self
            .store
            .courses(school_id)
            .await?
            .into_iter()
            .filter(|c| !c.is_group)
            .collect();

        let active = self.active_lessons(school_id, &horizon).await?;
        let facilities = self.store.facilities(school_id).await?;
        let mut ceiling = CapacityCeiling::new(&facilities, settings.timezone);
        for lesson in &active {
            ceiling.accept(lesson.span());
        }

        let mut codes = CodeGenerator::with_seen(CODE_LENGTH, self.store.issued_codes().await?);
        let mut emitted: HashSet<(Uuid, Uuid, DateTime<Utc>)> = HashSet::new();
        let mut planned = Vec::new();

        let contexts = try_join_all(teachers.iter().map(|teacher| {
            self.availability
                .schedule_context(teacher.id, first_day, last_day, booked_for(&active, teacher.id))
        }))
        .await?;

        for (teacher, context) in teachers.iter().zip(&contexts) {
            for course in courses.iter().filter(|c| teacher.teaches(c.id)) {
                for &day in &horizon.days {
                    for span in slots_on(context, &settings, course, day)? {
                        if span.start < now {
                            continue;
                        }
                        if !emitted.insert((teacher.id, course.id, span.start)) {
                            report.duplicates_skipped += 1;
                            continue;
                        }
                        if !ceiling.admits(&span) {
                            report.dropped_for_capacity += 1;
                            continue;
                        }
                        ceiling.accept(span);

                        planned.push(Lesson {
                            id: Uuid::new_v4(),
                            code: codes.next_unique(),
                            school_id,
                            course_id: course.id,
                            teacher_id: Some(teacher.id),
                            start: span.start,
                            end: span.stop,
                            status: LessonStatus::Available,
                            number_of_client: 0,
                            notified: false,
                        });
                    }
                }
            }
        }

        report.generated = self.store.insert_available_lessons(planned).await?;

        info!(
            "Planned {} lessons for school {} ({} cleared, {} over capacity, {} duplicates)",
            report.generated, school.name, report.cleared, report.dropped_for_capacity, report.duplicates_skipped
        );

        Ok(report)
    }

    /// Run the speculative planner for every school. A failing school is
    /// logged and skipped.
    pub async fn generate_for_all_schools(&self) -> Result<Vec<PlannerReport>, AppError> {
        let schools = self.store.schools().await?;
        let mut reports = Vec::with_capacity(schools.len());

        for school in schools {
            match self.generate_upcoming(school.id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Planning failed for school {} ({}): {}", school.name, school.id, e),
            }
        }

        Ok(reports)
    }

    // ==========================================================================
    // PERSONALIZED MODE
    // ==========================================================================

    pub async fn upcoming_for_student(&self, student_id: Uuid) -> Result<Vec<RegistrationPlan>, AppError> {
        self.upcoming_for_student_at(student_id, Utc::now()).await
    }

    /// Bookable times for each of a student's confirmed private registrations.
    /// Nothing is written.
    #[instrument(skip(self))]
    pub async fn upcoming_for_student_at(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistrationPlan>, AppError> {
        let registrations = self.store.registrations_for_student(student_id).await?;
        let mut plans = Vec::new();

        for registration in registrations {
            let Some(teacher_id) = registration.teacher_id else {
                continue;
            };
            if registration.payment_status != PaymentStatus::Confirm {
                debug!("Skipping unpaid registration {}", registration.uuid);
                continue;
            }

            let Some(course) = self.store.course(registration.course_id).await? else {
                warn!("Registration {} points at missing course {}", registration.uuid, registration.course_id);
                continue;
            };
            if course.is_group {
                continue;
            }
            let Some(teacher) = self.store.teacher(teacher_id).await? else {
                warn!("Registration {} points at missing teacher {}", registration.uuid, teacher_id);
                continue;
            };

            let school = self.school(course.school_id).await?;
            let settings = self.settings_for(&school).await?;
            let lessons = self.plan_registration(&registration, &course, &school, &settings, now).await?;

            plans.push(RegistrationPlan {
                course_name: course.name.clone(),
                course_description: course.description.clone(),
                registration_uuid: registration.uuid,
                instructor_picture: teacher.profile_image.clone(),
                instructor_name: teacher.full_name(),
                instructor_phone_number: teacher.phone_number.clone(),
                instructor_email: teacher.email.clone(),
                lesson_duration: course.duration,
                location: school.location.clone(),
                lessons,
            });
        }

        Ok(plans)
    }

    async fn plan_registration(
        &self,
        registration: &CourseRegistration,
        course: &Course,
        school: &School,
        settings: &SchedulingSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlannedLesson>, AppError> {
        let horizon = Horizon::starting(now, settings);
        let (Some(first_day), Some(last_day)) = (horizon.first(), horizon.last()) else {
            return Ok(Vec::new());
        };
        let Some(teacher_id) = registration.teacher_id else {
            return Ok(Vec::new());
        };

        let active = self.active_lessons(school.id, &horizon).await?;
        let facilities = self.store.facilities(school.id).await?;
        let mut ceiling = CapacityCeiling::new(&facilities, settings.timezone);
        for lesson in &active {
            ceiling.accept(lesson.span());
        }

        let context = self
            .availability
            .schedule_context(teacher_id, first_day, last_day, booked_for(&active, teacher_id))
            .await?;

        let mut starts = BTreeSet::new();
        for &day in horizon.days.iter().filter(|d| !registration.is_expired_on(**d)) {
            for span in slots_on(&context, settings, course, day)? {
                if span.start >= now && ceiling.admits(&span) {
                    starts.insert(span.start);
                }
            }
        }

        Ok(starts.into_iter().map(|datetime| PlannedLesson { datetime }).collect())
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn school(&self, school_id: Uuid) -> Result<School, AppError> {
        self.store
            .school(school_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("school {}", school_id)))
    }

    async fn settings_for(&self, school: &School) -> Result<SchedulingSettings, AppError> {
        let stored = self.store.settings(school.id).await?;
        if stored.is_none() {
            debug!("School {} has no settings, using defaults", school.id);
        }
        Ok(SchedulingSettings::resolve(school, stored.as_ref(), self.fallback_tz))
    }

    async fn active_lessons(&self, school_id: Uuid, horizon: &Horizon) -> Result<Vec<Lesson>, AppError> {
        Ok(self
            .store
            .lessons_for_school(school_id, horizon.from, horizon.to)
            .await?
            .into_iter()
            .filter(|l| l.status.is_active())
            .collect())
    }
}

fn booked_for(active: &[Lesson], teacher_id: Uuid) -> Vec<BookedSpan> {
    active
        .iter()
        .filter(|l| l.teacher_id == Some(teacher_id))
        .map(|l| BookedSpan::from(l.span()))
        .collect()
}

/// Open slots for `course` across all of the teacher's windows on `day`.
fn slots_on(
    context: &TeacherScheduleContext,
    settings: &SchedulingSettings,
    course: &Course,
    day: NaiveDate,
) -> Result<Vec<Span>, AppError> {
    let unavailable = context.exceptions_on(day);
    let mut spans = Vec::new();

    for (window_start, window_stop) in context.windows_for(day) {
        let query = SlotQuery {
            date: day,
            timezone: settings.timezone,
            window_start,
            window_stop,
            duration_minutes: course.duration,
            step_minutes: settings.interval_minutes,
            gap_minutes: settings.teacher_break_minutes,
            unavailable: &unavailable,
            booked: &context.booked,
        };
        spans.extend(compute_available_slots(&query)?.iter().map(|slot| slot.span()));
    }

    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn span(hour: u32, minutes: i64) -> Span {
        let start = Utc.with_ymd_and_hms(2024, 5, 6, hour, 0, 0).unwrap();
        Span::starting_at(start, minutes)
    }

    fn facility(capacity: i64) -> Facility {
        Facility {
            id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            name: "Room".to_string(),
            capacity,
        }
    }

    #[test]
    fn ceiling_counts_overlaps_per_day() {
        let mut ceiling = CapacityCeiling::new(&[facility(1), facility(1)], Tz::UTC);
        ceiling.accept(span(9, 60));
        assert!(ceiling.admits(&span(9, 60)));

        ceiling.accept(span(9, 60));
        assert!(!ceiling.admits(&span(9, 30)));
        // Touching at 10:00 does not overlap.
        assert!(ceiling.admits(&span(10, 60)));
    }

    #[test]
    fn lesson_past_midnight_counts_on_the_next_day() {
        let late = Span::starting_at(Utc.with_ymd_and_hms(2024, 5, 6, 23, 30, 0).unwrap(), 60);
        let after_midnight = Span::starting_at(Utc.with_ymd_and_hms(2024, 5, 7, 0, 0, 0).unwrap(), 60);
        let later = Span::starting_at(Utc.with_ymd_and_hms(2024, 5, 7, 0, 30, 0).unwrap(), 60);

        let mut ceiling = CapacityCeiling::new(&[facility(1)], Tz::UTC);
        ceiling.accept(late);
        assert!(!ceiling.admits(&after_midnight));
        assert!(ceiling.admits(&later));

        // Both directions: a candidate crossing midnight sees next-day lessons.
        let mut ceiling = CapacityCeiling::new(&[facility(1)], Tz::UTC);
        ceiling.accept(after_midnight);
        assert!(!ceiling.admits(&late));
    }

    #[test]
    fn spans_on_both_days_are_counted_once() {
        let late = Span::starting_at(Utc.with_ymd_and_hms(2024, 5, 6, 23, 30, 0).unwrap(), 60);
        let mut ceiling = CapacityCeiling::new(&[facility(2)], Tz::UTC);

        ceiling.accept(late);
        assert!(ceiling.admits(&late));
        ceiling.accept(late);
        assert!(!ceiling.admits(&late));
    }

    #[test]
    fn no_facilities_means_no_ceiling() {
        let mut ceiling = CapacityCeiling::new(&[], Tz::UTC);
        for _ in 0..10 {
            ceiling.accept(span(9, 60));
        }
        assert!(ceiling.admits(&span(9, 60)));
    }

    #[test]
    fn horizon_covers_days_ahead_from_local_today() {
        let school = School {
            id: Uuid::nil(),
            name: "School".to_string(),
            location: None,
            timezone: Some("Asia/Bangkok".to_string()),
        };
        let settings = SchedulingSettings::resolve(&school, None, Tz::UTC);
        // 20:00 UTC is already the next day in Bangkok.
        let now = Utc.with_ymd_and_hms(2024, 5, 5, 20, 0, 0).unwrap();

        let horizon = Horizon::starting(now, &settings);
        assert_eq!(horizon.days.len(), settings.days_ahead as usize);
        assert_eq!(horizon.first(), NaiveDate::from_ymd_opt(2024, 5, 6));
        assert_eq!(horizon.to - horizon.from, Duration::days(settings.days_ahead));
    }
}
