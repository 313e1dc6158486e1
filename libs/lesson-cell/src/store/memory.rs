use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_models::AppError;

use crate::models::{
    Booking, BookingWrite, Course, CourseRegistration, Facility, Lesson, LessonChange, LessonStatus,
    LessonWrite, PaymentStatus, School, SchoolSettings, Teacher,
};
use crate::store::LessonStore;

#[derive(Default)]
struct MemoryState {
    schools: Vec<School>,
    settings: HashMap<Uuid, SchoolSettings>,
    facilities: Vec<Facility>,
    teachers: Vec<Teacher>,
    courses: Vec<Course>,
    registrations: HashMap<Uuid, CourseRegistration>,
    lessons: HashMap<Uuid, Lesson>,
    bookings: HashMap<Uuid, Booking>,
}

/// Store backed by process memory. A single write lock makes every commit
/// atomic.
#[derive(Default)]
pub struct MemoryLessonStore {
    state: RwLock<MemoryState>,
}

impl MemoryLessonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_school(&self, school: School) {
        let mut state = self.state.write().await;
        state.schools.retain(|s| s.id != school.id);
        state.schools.push(school);
    }

    pub async fn put_settings(&self, settings: SchoolSettings) {
        self.state.write().await.settings.insert(settings.school_id, settings);
    }

    pub async fn put_facility(&self, facility: Facility) {
        self.state.write().await.facilities.push(facility);
    }

    pub async fn put_teacher(&self, teacher: Teacher) {
        let mut state = self.state.write().await;
        state.teachers.retain(|t| t.id != teacher.id);
        state.teachers.push(teacher);
    }

    pub async fn put_course(&self, course: Course) {
        let mut state = self.state.write().await;
        state.courses.retain(|c| c.id != course.id);
        state.courses.push(course);
    }

    pub async fn put_registration(&self, registration: CourseRegistration) {
        self.state.write().await.registrations.insert(registration.uuid, registration);
    }

    pub async fn put_lesson(&self, lesson: Lesson) {
        self.state.write().await.lessons.insert(lesson.id, lesson);
    }

    pub async fn put_booking(&self, booking: Booking) {
        self.state.write().await.bookings.insert(booking.id, booking);
    }

    pub async fn all_lessons(&self) -> Vec<Lesson> {
        let mut lessons: Vec<Lesson> = self.state.read().await.lessons.values().cloned().collect();
        lessons.sort_by_key(|l| (l.start, l.code.clone()));
        lessons
    }
}

fn in_range(lesson: &Lesson, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    lesson.start < to && from < lesson.end
}

#[async_trait]
impl LessonStore for MemoryLessonStore {
    async fn schools(&self) -> Result<Vec<School>, AppError> {
        Ok(self.state.read().await.schools.clone())
    }

    async fn school(&self, id: Uuid) -> Result<Option<School>, AppError> {
        Ok(self.state.read().await.schools.iter().find(|s| s.id == id).cloned())
    }

    async fn settings(&self, school_id: Uuid) -> Result<Option<SchoolSettings>, AppError> {
        Ok(self.state.read().await.settings.get(&school_id).cloned())
    }

    async fn facilities(&self, school_id: Uuid) -> Result<Vec<Facility>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .facilities
            .iter()
            .filter(|f| f.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn teachers(&self, school_id: Uuid) -> Result<Vec<Teacher>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .teachers
            .iter()
            .filter(|t| t.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn teacher(&self, id: Uuid) -> Result<Option<Teacher>, AppError> {
        Ok(self.state.read().await.teachers.iter().find(|t| t.id == id).cloned())
    }

    async fn courses(&self, school_id: Uuid) -> Result<Vec<Course>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .courses
            .iter()
            .filter(|c| c.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn course(&self, id: Uuid) -> Result<Option<Course>, AppError> {
        Ok(self.state.read().await.courses.iter().find(|c| c.id == id).cloned())
    }

    async fn registration(&self, uuid: Uuid) -> Result<Option<CourseRegistration>, AppError> {
        Ok(self.state.read().await.registrations.get(&uuid).cloned())
    }

    async fn registrations_for_student(&self, student_id: Uuid) -> Result<Vec<CourseRegistration>, AppError> {
        let mut found: Vec<CourseRegistration> = self
            .state
            .read()
            .await
            .registrations
            .values()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.registered_date, r.uuid));
        Ok(found)
    }

    async fn insert_registration(&self, registration: &CourseRegistration) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if state.registrations.contains_key(&registration.uuid) {
            return Err(AppError::Database(format!("duplicate registration {}", registration.uuid)));
        }
        state.registrations.insert(registration.uuid, registration.clone());
        Ok(())
    }

    async fn set_payment_status(&self, uuid: Uuid, status: PaymentStatus) -> Result<(), AppError> {
        match self.state.write().await.registrations.get_mut(&uuid) {
            Some(registration) => {
                registration.payment_status = status;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("registration {}", uuid))),
        }
    }

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, AppError> {
        Ok(self.state.read().await.lessons.get(&id).cloned())
    }

    async fn lesson_by_code(&self, code: &str) -> Result<Option<Lesson>, AppError> {
        Ok(self.state.read().await.lessons.values().find(|l| l.code == code).cloned())
    }

    async fn lessons_for_teacher(
        &self,
        teacher_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        let mut found: Vec<Lesson> = self
            .state
            .read()
            .await
            .lessons
            .values()
            .filter(|l| l.teacher_id == Some(teacher_id) && in_range(l, from, to))
            .cloned()
            .collect();
        found.sort_by_key(|l| l.start);
        Ok(found)
    }

    async fn lessons_for_school(
        &self,
        school_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        let mut found: Vec<Lesson> = self
            .state
            .read()
            .await
            .lessons
            .values()
            .filter(|l| l.school_id == school_id && in_range(l, from, to))
            .cloned()
            .collect();
        found.sort_by_key(|l| l.start);
        Ok(found)
    }

    async fn booking_by_code(&self, code: &str) -> Result<Option<Booking>, AppError> {
        Ok(self.state.read().await.bookings.values().find(|b| b.code == code).cloned())
    }

    async fn bookings_for_lesson(&self, lesson_id: Uuid) -> Result<Vec<Booking>, AppError> {
        let mut found: Vec<Booking> = self
            .state
            .read()
            .await
            .bookings
            .values()
            .filter(|b| b.lesson_id == lesson_id)
            .cloned()
            .collect();
        found.sort_by_key(|b| b.created_at);
        Ok(found)
    }

    async fn issued_codes(&self) -> Result<Vec<String>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .lessons
            .values()
            .map(|l| l.code.clone())
            .chain(state.bookings.values().map(|b| b.code.clone()))
            .collect())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, AppError> {
        let state = self.state.read().await;
        Ok(state.lessons.values().any(|l| l.code == code)
            || state.bookings.values().any(|b| b.code == code))
    }

    async fn commit(&self, change: LessonChange) -> Result<(), AppError> {
        let mut state = self.state.write().await;

        // Validate everything before the first mutation.
        match &change.lesson {
            LessonWrite::Insert { lesson } => {
                if state.lessons.values().any(|l| l.code == lesson.code) {
                    return Err(AppError::Database(format!("duplicate lesson code {}", lesson.code)));
                }
            }
            LessonWrite::Update { lesson, expected } => match state.lessons.get(&lesson.id) {
                Some(current) if current.status == *expected => {}
                Some(current) => {
                    return Err(AppError::StaleState(format!(
                        "lesson {} is {}, expected {}",
                        lesson.code, current.status, expected
                    )))
                }
                None => return Err(AppError::NotFound(format!("lesson {}", lesson.code))),
            },
        }

        for write in &change.bookings {
            if let BookingWrite::Update { booking } = write {
                if !state.bookings.contains_key(&booking.id) {
                    return Err(AppError::NotFound(format!("booking {}", booking.code)));
                }
            }
        }

        for write in &change.registrations {
            match state.registrations.get(&write.uuid) {
                Some(current) if current.lessons_left == write.expected_lessons_left => {}
                Some(current) => {
                    return Err(AppError::StaleState(format!(
                        "registration {} has {} lessons left, expected {}",
                        write.uuid, current.lessons_left, write.expected_lessons_left
                    )))
                }
                None => return Err(AppError::NotFound(format!("registration {}", write.uuid))),
            }
        }

        let lesson = change.lesson.lesson().clone();
        debug!("Committing lesson {} as {}", lesson.code, lesson.status);
        state.lessons.insert(lesson.id, lesson);

        for write in change.bookings {
            let booking = match write {
                BookingWrite::Insert { booking } | BookingWrite::Update { booking } => booking,
            };
            state.bookings.insert(booking.id, booking);
        }

        for write in change.registrations {
            if let Some(registration) = state.registrations.get_mut(&write.uuid) {
                registration.lessons_left = write.lessons_left;
            }
        }

        for id in change.prune_available {
            if matches!(state.lessons.get(&id), Some(l) if l.status == LessonStatus::Available) {
                state.lessons.remove(&id);
            }
        }

        Ok(())
    }

    async fn delete_available_lessons(
        &self,
        teacher_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut state = self.state.write().await;
        let before = state.lessons.len();
        state.lessons.retain(|_, l| {
            !(l.status == LessonStatus::Available
                && l.teacher_id.map(|t| teacher_ids.contains(&t)).unwrap_or(false)
                && l.start >= from
                && l.start < to)
        });
        Ok(before - state.lessons.len())
    }

    async fn insert_available_lessons(&self, lessons: Vec<Lesson>) -> Result<usize, AppError> {
        let mut state = self.state.write().await;
        let count = lessons.len();
        for lesson in lessons {
            state.lessons.insert(lesson.id, lesson);
        }
        Ok(count)
    }

    async fn due_for_reminder(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        let mut found: Vec<Lesson> = self
            .state
            .read()
            .await
            .lessons
            .values()
            .filter(|l| {
                l.status == LessonStatus::Confirmed && !l.notified && l.start >= from && l.start <= until
            })
            .cloned()
            .collect();
        found.sort_by_key(|l| l.start);
        Ok(found)
    }

    async fn mark_notified(&self, lesson_id: Uuid) -> Result<(), AppError> {
        match self.state.write().await.lessons.get_mut(&lesson_id) {
            Some(lesson) => {
                lesson.notified = true;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("lesson {}", lesson_id))),
        }
    }
}
