pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use shared_models::AppError;

use crate::models::{
    Booking, Course, CourseRegistration, Facility, Lesson, LessonChange, PaymentStatus, School,
    SchoolSettings, Teacher,
};

pub use memory::MemoryLessonStore;
pub use supabase::SupabaseLessonStore;

#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn schools(&self) -> Result<Vec<School>, AppError>;

    async fn school(&self, id: Uuid) -> Result<Option<School>, AppError>;

    async fn settings(&self, school_id: Uuid) -> Result<Option<SchoolSettings>, AppError>;

    async fn facilities(&self, school_id: Uuid) -> Result<Vec<Facility>, AppError>;

    async fn teachers(&self, school_id: Uuid) -> Result<Vec<Teacher>, AppError>;

    async fn teacher(&self, id: Uuid) -> Result<Option<Teacher>, AppError>;

    async fn courses(&self, school_id: Uuid) -> Result<Vec<Course>, AppError>;

    async fn course(&self, id: Uuid) -> Result<Option<Course>, AppError>;

    async fn registration(&self, uuid: Uuid) -> Result<Option<CourseRegistration>, AppError>;

    async fn registrations_for_student(&self, student_id: Uuid) -> Result<Vec<CourseRegistration>, AppError>;

    async fn insert_registration(&self, registration: &CourseRegistration) -> Result<(), AppError>;

    async fn set_payment_status(&self, uuid: Uuid, status: PaymentStatus) -> Result<(), AppError>;

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, AppError>;

    async fn lesson_by_code(&self, code: &str) -> Result<Option<Lesson>, AppError>;

    /// Lessons of any status overlapping `[from, to)`.
    async fn lessons_for_teacher(
        &self,
        teacher_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError>;

    async fn lessons_for_school(
        &self,
        school_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError>;

    async fn booking_by_code(&self, code: &str) -> Result<Option<Booking>, AppError>;

    async fn bookings_for_lesson(&self, lesson_id: Uuid) -> Result<Vec<Booking>, AppError>;

    /// Every lesson and booking code ever issued.
    async fn issued_codes(&self) -> Result<Vec<String>, AppError>;

    async fn code_exists(&self, code: &str) -> Result<bool, AppError>;

    /// Apply a transition atomically. Fails with `StaleState` when a lesson
    /// or registration no longer matches what the change expected.
    async fn commit(&self, change: LessonChange) -> Result<(), AppError>;

    /// Delete AVAILABLE lessons of `teacher_ids` starting in `[from, to)`.
    async fn delete_available_lessons(
        &self,
        teacher_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    async fn insert_available_lessons(&self, lessons: Vec<Lesson>) -> Result<usize, AppError>;

    /// CONFIRMED, not yet notified lessons starting in `[from, until]`.
    async fn due_for_reminder(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError>;

    async fn mark_notified(&self, lesson_id: Uuid) -> Result<(), AppError>;
}
