#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use availability_cell::{AvailabilityStore, MemoryAvailabilityStore, WeeklyAvailability};
use lesson_cell::{
    Booking, BookingParty, BookingRules, BookingService, BookingStatus, Course, CourseRegistration,
    Lesson, LessonStatus, MemoryLessonStore, Notification, Notifier, PaymentStatus, School,
    SchoolSettings, Teacher,
};
use shared_database::LocalLock;
use shared_models::Actor;
use shared_utils::codes::{generate_code, CODE_LENGTH};
use shared_utils::test_utils::{time, TestUser};

/// Notifier that keeps everything it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
        anyhow::bail!("push gateway unavailable")
    }
}

/// A Monday at least a week out, so bookings are always in the future.
pub fn future_monday() -> NaiveDate {
    let today = Utc::now().date_naive();
    let to_monday = 7 - today.weekday().num_days_from_monday() as u64;
    today + Days::new(to_monday + 7)
}

pub fn at(day: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(time(hour, minute)))
}

pub struct Fixture {
    pub store: Arc<MemoryLessonStore>,
    pub availability: Arc<MemoryAvailabilityStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: BookingService,
    pub school: School,
    pub teacher: Teacher,
    pub private_course: Course,
    pub group_course: Course,
    pub student_id: Uuid,
    pub day: NaiveDate,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_settings(SchoolSettings::default()).await
    }

    pub async fn with_settings(settings: SchoolSettings) -> Self {
        let store = Arc::new(MemoryLessonStore::new());
        let availability = Arc::new(MemoryAvailabilityStore::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let school = School {
            id: Uuid::new_v4(),
            name: "Riverside Music School".to_string(),
            location: Some("12 River Road".to_string()),
            timezone: Some("UTC".to_string()),
        };
        let private_course = course(school.id, "Piano", false, 1);
        let group_course = course(school.id, "Choir", true, 5);
        let teacher = teacher(school.id, &[private_course.id, group_course.id]);

        store.put_school(school.clone()).await;
        store
            .put_settings(SchoolSettings {
                school_id: school.id,
                ..settings
            })
            .await;
        store.put_course(private_course.clone()).await;
        store.put_course(group_course.clone()).await;
        store.put_teacher(teacher.clone()).await;

        let service = BookingService::new(
            store.clone(),
            availability.clone(),
            Arc::new(LocalLock::new()),
            notifier.clone(),
            BookingRules::default(),
        );

        let fixture = Self {
            store,
            availability,
            notifier,
            service,
            school,
            teacher,
            private_course,
            group_course,
            student_id: Uuid::new_v4(),
            day: future_monday(),
        };
        fixture.weekly(1, (9, 0), (17, 0)).await;
        fixture
    }

    pub fn manager(&self) -> Actor {
        TestUser::manager(self.school.id)
    }

    pub fn student(&self) -> Actor {
        TestUser::student(self.student_id, self.school.id)
    }

    pub fn teacher_actor(&self) -> Actor {
        TestUser::teacher(self.teacher.user_id, self.school.id)
    }

    pub fn at(&self, hour: u32, minute: u32) -> DateTime<Utc> {
        at(self.day, hour, minute)
    }

    pub async fn weekly(&self, day: u8, start: (u32, u32), stop: (u32, u32)) {
        self.availability
            .insert_weekly(&WeeklyAvailability {
                id: Uuid::new_v4(),
                teacher_id: self.teacher.id,
                day,
                start: time(start.0, start.1),
                stop: time(stop.0, stop.1),
                code: generate_code(CODE_LENGTH),
            })
            .await
            .unwrap();
    }

    pub async fn registration(&self, course: &Course, lessons_left: i64) -> CourseRegistration {
        let registration = CourseRegistration {
            uuid: Uuid::new_v4(),
            student_id: self.student_id,
            course_id: course.id,
            teacher_id: (!course.is_group).then_some(self.teacher.id),
            registered_date: Utc::now().date_naive(),
            lessons_left,
            exp_date: None,
            payment_status: PaymentStatus::Confirm,
        };
        self.store.put_registration(registration.clone()).await;
        registration
    }

    pub async fn lesson(&self, course: &Course, start: DateTime<Utc>, status: LessonStatus) -> Lesson {
        let lesson = Lesson {
            id: Uuid::new_v4(),
            code: generate_code(CODE_LENGTH),
            school_id: self.school.id,
            course_id: course.id,
            teacher_id: Some(self.teacher.id),
            start,
            end: start + chrono::Duration::minutes(course.duration),
            status,
            number_of_client: 0,
            notified: false,
        };
        self.store.put_lesson(lesson.clone()).await;
        lesson
    }

    pub async fn guest_booking(&self, lesson: &Lesson, name: &str) -> Booking {
        let booking = Booking {
            id: Uuid::new_v4(),
            code: generate_code(CODE_LENGTH),
            lesson_id: lesson.id,
            party: BookingParty::Guest {
                name: name.to_string(),
                email: None,
            },
            status: BookingStatus::Completed,
            check_in: None,
            check_out: None,
            missed: false,
            charged: false,
            created_at: Utc::now(),
        };
        self.store.put_booking(booking.clone()).await;
        booking
    }

    pub async fn lessons_left(&self, uuid: Uuid) -> i64 {
        use lesson_cell::LessonStore;
        self.store.registration(uuid).await.unwrap().unwrap().lessons_left
    }

    pub async fn stored_lesson(&self, id: Uuid) -> Lesson {
        use lesson_cell::LessonStore;
        self.store.lesson(id).await.unwrap().unwrap()
    }
}

pub fn course(school_id: Uuid, name: &str, is_group: bool, group_size: i64) -> Course {
    Course {
        id: Uuid::new_v4(),
        school_id,
        name: name.to_string(),
        description: Some(format!("{} lessons", name)),
        duration: 60,
        is_group,
        group_size,
        price: 1200.0,
        no_exp: true,
        exp_range: 0,
        number_of_lessons: 10,
    }
}

pub fn teacher(school_id: Uuid, course_ids: &[Uuid]) -> Teacher {
    Teacher {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        school_id,
        first_name: "Mali".to_string(),
        last_name: "Srisuk".to_string(),
        email: Some("mali@example.com".to_string()),
        phone_number: Some("+66 2 000 0000".to_string()),
        profile_image: None,
        course_ids: course_ids.to_vec(),
    }
}
