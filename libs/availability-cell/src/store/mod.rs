pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use shared_models::AppError;

use crate::models::{UnavailabilityException, WeeklyAvailability};

pub use memory::MemoryAvailabilityStore;
pub use supabase::SupabaseAvailabilityStore;

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn weekly_for_teacher(&self, teacher_id: Uuid) -> Result<Vec<WeeklyAvailability>, AppError>;

    async fn weekly_by_code(&self, code: &str) -> Result<Option<WeeklyAvailability>, AppError>;

    async fn insert_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError>;

    async fn update_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError>;

    async fn delete_weekly(&self, code: &str) -> Result<(), AppError>;

    /// Exceptions dated within `[from, to]`.
    async fn exceptions_for_teacher(
        &self,
        teacher_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UnavailabilityException>, AppError>;

    async fn exception_by_code(&self, code: &str) -> Result<Option<UnavailabilityException>, AppError>;

    /// Replace `absorbed` exceptions with `merged` in one write.
    async fn replace_exceptions(
        &self,
        absorbed: &[String],
        merged: &UnavailabilityException,
    ) -> Result<(), AppError>;

    async fn delete_exception(&self, code: &str) -> Result<(), AppError>;
}
