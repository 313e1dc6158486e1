use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use shared_database::supabase::{SupabaseClient, SupabaseError, DEFAULT_CHUNK_SIZE};
use shared_models::AppError;

use crate::models::{
    Booking, Course, CourseRegistration, Facility, Lesson, LessonChange, PaymentStatus, School,
    SchoolSettings, Teacher,
};
use crate::store::LessonStore;

/// PostgREST adapter. Transitions go through the `commit_lesson_change`
/// function, which runs them in one transaction and raises `stale_state`
/// when an expected status or balance no longer matches.
pub struct SupabaseLessonStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseLessonStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AppError> {
        self.supabase
            .request::<Vec<T>>(Method::GET, path, None, None)
            .await
            .map_err(|e| {
                error!("Lesson store query failed for {}: {}", path, e);
                AppError::Database(e.to_string())
            })
    }

    async fn fetch_one<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, AppError> {
        Ok(self.fetch::<T>(path).await?.into_iter().next())
    }

    async fn write(&self, method: Method, path: &str, body: Option<Value>) -> Result<(), AppError> {
        self.supabase
            .request::<Value>(method, path, None, body)
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("Lesson store write failed for {}: {}", path, e);
                AppError::Database(e.to_string())
            })
    }
}

fn ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_row<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

fn id_list(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
}

/// Translate exceptions raised by `commit_lesson_change`.
fn commit_error(e: anyhow::Error) -> AppError {
    let body = e
        .downcast_ref::<SupabaseError>()
        .map(|err| err.body().to_string())
        .unwrap_or_else(|| e.to_string());

    if body.contains("stale_state") {
        AppError::StaleState(body)
    } else if body.contains("not_found") {
        AppError::NotFound(body)
    } else {
        error!("Lesson change commit failed: {}", body);
        AppError::Database(body)
    }
}

#[async_trait]
impl LessonStore for SupabaseLessonStore {
    async fn schools(&self) -> Result<Vec<School>, AppError> {
        self.fetch("/rest/v1/schools?order=name.asc").await
    }

    async fn school(&self, id: Uuid) -> Result<Option<School>, AppError> {
        self.fetch_one(&format!("/rest/v1/schools?id=eq.{}&limit=1", id)).await
    }

    async fn settings(&self, school_id: Uuid) -> Result<Option<SchoolSettings>, AppError> {
        self.fetch_one(&format!("/rest/v1/school_settings?school_id=eq.{}&limit=1", school_id)).await
    }

    async fn facilities(&self, school_id: Uuid) -> Result<Vec<Facility>, AppError> {
        self.fetch(&format!("/rest/v1/facilities?school_id=eq.{}", school_id)).await
    }

    async fn teachers(&self, school_id: Uuid) -> Result<Vec<Teacher>, AppError> {
        self.fetch(&format!("/rest/v1/teachers?school_id=eq.{}&order=last_name.asc", school_id)).await
    }

    async fn teacher(&self, id: Uuid) -> Result<Option<Teacher>, AppError> {
        self.fetch_one(&format!("/rest/v1/teachers?id=eq.{}&limit=1", id)).await
    }

    async fn courses(&self, school_id: Uuid) -> Result<Vec<Course>, AppError> {
        self.fetch(&format!("/rest/v1/courses?school_id=eq.{}", school_id)).await
    }

    async fn course(&self, id: Uuid) -> Result<Option<Course>, AppError> {
        self.fetch_one(&format!("/rest/v1/courses?id=eq.{}&limit=1", id)).await
    }

    async fn registration(&self, uuid: Uuid) -> Result<Option<CourseRegistration>, AppError> {
        self.fetch_one(&format!("/rest/v1/course_registrations?uuid=eq.{}&limit=1", uuid)).await
    }

    async fn registrations_for_student(&self, student_id: Uuid) -> Result<Vec<CourseRegistration>, AppError> {
        self.fetch(&format!(
            "/rest/v1/course_registrations?student_id=eq.{}&order=registered_date.asc",
            student_id
        ))
        .await
    }

    async fn insert_registration(&self, registration: &CourseRegistration) -> Result<(), AppError> {
        self.write(Method::POST, "/rest/v1/course_registrations", Some(to_row(registration)?)).await
    }

    async fn set_payment_status(&self, uuid: Uuid, status: PaymentStatus) -> Result<(), AppError> {
        let path = format!("/rest/v1/course_registrations?uuid=eq.{}", uuid);
        self.write(Method::PATCH, &path, Some(json!({ "payment_status": status }))).await
    }

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, AppError> {
        self.fetch_one(&format!("/rest/v1/lessons?id=eq.{}&limit=1", id)).await
    }

    async fn lesson_by_code(&self, code: &str) -> Result<Option<Lesson>, AppError> {
        self.fetch_one(&format!("/rest/v1/lessons?code=eq.{}&limit=1", code)).await
    }

    async fn lessons_for_teacher(
        &self,
        teacher_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        self.fetch(&format!(
            "/rest/v1/lessons?teacher_id=eq.{}&start=lt.{}&end=gt.{}&order=start.asc",
            teacher_id,
            ts(to),
            ts(from)
        ))
        .await
    }

    async fn lessons_for_school(
        &self,
        school_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        self.fetch(&format!(
            "/rest/v1/lessons?school_id=eq.{}&start=lt.{}&end=gt.{}&order=start.asc",
            school_id,
            ts(to),
            ts(from)
        ))
        .await
    }

    async fn booking_by_code(&self, code: &str) -> Result<Option<Booking>, AppError> {
        self.fetch_one(&format!("/rest/v1/bookings?code=eq.{}&limit=1", code)).await
    }

    async fn bookings_for_lesson(&self, lesson_id: Uuid) -> Result<Vec<Booking>, AppError> {
        self.fetch(&format!("/rest/v1/bookings?lesson_id=eq.{}&order=created_at.asc", lesson_id)).await
    }

    async fn issued_codes(&self) -> Result<Vec<String>, AppError> {
        #[derive(serde::Deserialize)]
        struct CodeRow {
            code: String,
        }

        let lessons: Vec<CodeRow> = self.fetch("/rest/v1/lessons?select=code").await?;
        let bookings: Vec<CodeRow> = self.fetch("/rest/v1/bookings?select=code").await?;

        Ok(lessons.into_iter().chain(bookings).map(|row| row.code).collect())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, AppError> {
        if self.lesson_by_code(code).await?.is_some() {
            return Ok(true);
        }
        Ok(self.booking_by_code(code).await?.is_some())
    }

    async fn commit(&self, change: LessonChange) -> Result<(), AppError> {
        let code = change.lesson.lesson().code.clone();
        let params = json!({ "change": to_row(&change)? });

        self.supabase
            .rpc::<Value>("commit_lesson_change", params)
            .await
            .map_err(commit_error)?;

        debug!("Committed lesson change for {}", code);
        Ok(())
    }

    async fn delete_available_lessons(
        &self,
        teacher_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        if teacher_ids.is_empty() {
            return Ok(0);
        }

        let path = format!(
            "/rest/v1/lessons?status=eq.AVAILABLE&teacher_id=in.({})&start=gte.{}&start=lt.{}",
            id_list(teacher_ids),
            ts(from),
            ts(to)
        );

        let removed: Option<Vec<Value>> = self
            .supabase
            .request_with_headers(
                Method::DELETE,
                &path,
                None,
                None,
                Some(SupabaseClient::return_representation()),
            )
            .await
            .map_err(|e| {
                error!("Clearing available lessons failed: {}", e);
                AppError::Database(e.to_string())
            })?;

        Ok(removed.map(|rows| rows.len()).unwrap_or(0))
    }

    async fn insert_available_lessons(&self, lessons: Vec<Lesson>) -> Result<usize, AppError> {
        let rows = lessons.iter().map(to_row).collect::<Result<Vec<_>, _>>()?;

        self.supabase
            .insert_chunked("/rest/v1/lessons", rows, DEFAULT_CHUNK_SIZE)
            .await
            .map_err(|e| {
                error!("Inserting available lessons failed: {}", e);
                AppError::Database(e.to_string())
            })
    }

    async fn due_for_reminder(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, AppError> {
        self.fetch(&format!(
            "/rest/v1/lessons?status=eq.CONFIRMED&notified=is.false&start=gte.{}&start=lte.{}&order=start.asc",
            ts(from),
            ts(until)
        ))
        .await
    }

    async fn mark_notified(&self, lesson_id: Uuid) -> Result<(), AppError> {
        let path = format!("/rest/v1/lessons?id=eq.{}", lesson_id);
        self.write(Method::PATCH, &path, Some(json!({ "notified": true }))).await
    }
}
