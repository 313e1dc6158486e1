use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;
use shared_models::AppError;

use crate::models::{UnavailabilityException, WeeklyAvailability};
use crate::store::AvailabilityStore;

const WEEKLY_PATH: &str = "/rest/v1/weekly_availability";
const EXCEPTIONS_PATH: &str = "/rest/v1/unavailability_exceptions";

pub struct SupabaseAvailabilityStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAvailabilityStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AppError> {
        self.supabase
            .request::<Vec<T>>(Method::GET, path, None, None)
            .await
            .map_err(|e| {
                error!("Availability query failed for {}: {}", path, e);
                AppError::Database(e.to_string())
            })
    }

    async fn write(&self, method: Method, path: &str, body: Option<Value>) -> Result<(), AppError> {
        self.supabase
            .request::<Value>(method, path, None, body)
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("Availability write failed for {}: {}", path, e);
                AppError::Database(e.to_string())
            })
    }
}

fn to_row<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

#[async_trait]
impl AvailabilityStore for SupabaseAvailabilityStore {
    async fn weekly_for_teacher(&self, teacher_id: Uuid) -> Result<Vec<WeeklyAvailability>, AppError> {
        let path = format!("{}?teacher_id=eq.{}&order=day.asc,start.asc", WEEKLY_PATH, teacher_id);
        self.fetch(&path).await
    }

    async fn weekly_by_code(&self, code: &str) -> Result<Option<WeeklyAvailability>, AppError> {
        let path = format!("{}?code=eq.{}&limit=1", WEEKLY_PATH, code);
        Ok(self.fetch::<WeeklyAvailability>(&path).await?.into_iter().next())
    }

    async fn insert_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError> {
        debug!("Inserting weekly availability {}", availability.code);
        self.write(Method::POST, WEEKLY_PATH, Some(to_row(availability)?)).await
    }

    async fn update_weekly(&self, availability: &WeeklyAvailability) -> Result<(), AppError> {
        let path = format!("{}?code=eq.{}", WEEKLY_PATH, availability.code);
        let body = json!({
            "day": availability.day,
            "start": availability.start,
            "stop": availability.stop,
        });
        self.write(Method::PATCH, &path, Some(body)).await
    }

    async fn delete_weekly(&self, code: &str) -> Result<(), AppError> {
        let path = format!("{}?code=eq.{}", WEEKLY_PATH, code);
        self.write(Method::DELETE, &path, None).await
    }

    async fn exceptions_for_teacher(
        &self,
        teacher_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UnavailabilityException>, AppError> {
        let path = format!(
            "{}?teacher_id=eq.{}&date=gte.{}&date=lte.{}&order=date.asc,start.asc",
            EXCEPTIONS_PATH, teacher_id, from, to
        );
        self.fetch(&path).await
    }

    async fn exception_by_code(&self, code: &str) -> Result<Option<UnavailabilityException>, AppError> {
        let path = format!("{}?code=eq.{}&limit=1", EXCEPTIONS_PATH, code);
        Ok(self.fetch::<UnavailabilityException>(&path).await?.into_iter().next())
    }

    async fn replace_exceptions(
        &self,
        absorbed: &[String],
        merged: &UnavailabilityException,
    ) -> Result<(), AppError> {
        // One function call so the delete and insert share a transaction.
        let params = json!({
            "absorbed_codes": absorbed,
            "merged": to_row(merged)?,
        });

        self.supabase
            .rpc::<Value>("replace_unavailability_exceptions", params)
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("Exception merge failed for {}: {}", merged.code, e);
                AppError::Database(e.to_string())
            })
    }

    async fn delete_exception(&self, code: &str) -> Result<(), AppError> {
        let path = format!("{}?code=eq.{}", EXCEPTIONS_PATH, code);
        self.write(Method::DELETE, &path, None).await
    }
}
