use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;
use uuid::Uuid;

use shared_models::AppError;

use crate::models::{UnavailabilityException, WeeklyAvailability};
use crate::store::AvailabilityStore;

#[derive(Default)]
pub struct MemoryAvailabilityStore {
    weekly: RwLock<Vec<WeeklyAvailability>>,
    exceptions: RwLock<Vec<UnavailabilityException>>,
}

impl MemoryAvailabilityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AvailabilityStore for MemoryAvailabilityStore {
    async fn weekly_for_teacher(&self, teacher_id: Uuid) -> Result<Vec<WeeklyAvailability>, AppError> {
        Ok(self
            .weekly
            .read()
            .await
            .iter()
            .filter(|w| w.teacher_id == teacher_id)
            .cloned()
            .collect())
    }

    async fn weekly_by_code(&self, code: &str) -> Result<Option<WeeklyAvailability>, AppError> {
        Ok(self.weekly.read().await.iter().find(|w| w.code == code).cloned())
    }

    async fn insert_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError> {
        let mut weekly = self.weekly.write().await;
        if weekly.iter().any(|w| w.code == availability.code) {
            return Err(AppError::Database(format!("duplicate availability code {}", availability.code)));
        }
        weekly.push(availability.clone());
        Ok(())
    }

    async fn update_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError> {
        let mut weekly = self.weekly.write().await;
        match weekly.iter_mut().find(|w| w.code == availability.code) {
            Some(existing) => {
                *existing = availability.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("availability {}", availability.code))),
        }
    }

    async fn delete_weekly(&self, code: &str) -> Result<(), AppError> {
        self.weekly.write().await.retain(|w| w.code != code);
        Ok(())
    }

    async fn exceptions_for_teacher(
        &self,
        teacher_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UnavailabilityException>, AppError> {
        let mut found: Vec<UnavailabilityException> = self
            .exceptions
            .read()
            .await
            .iter()
            .filter(|e| e.teacher_id == teacher_id && e.date >= from && e.date <= to)
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.date, e.start));
        Ok(found)
    }

    async fn exception_by_code(&self, code: &str) -> Result<Option<UnavailabilityException>, AppError> {
        Ok(self.exceptions.read().await.iter().find(|e| e.code == code).cloned())
    }

    async fn replace_exceptions(
        &self,
        absorbed: &[String],
        merged: &UnavailabilityException,
    ) -> Result<(), AppError> {
        let mut exceptions = self.exceptions.write().await;
        exceptions.retain(|e| !absorbed.contains(&e.code));
        exceptions.push(merged.clone());
        Ok(())
    }

    async fn delete_exception(&self, code: &str) -> Result<(), AppError> {
        self.exceptions.write().await.retain(|e| e.code != code);
        Ok(())
    }
}
