use thiserror::Error;

use shared_models::AppError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Job lock error: {0}")]
    Lock(String),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] AppError),
}
