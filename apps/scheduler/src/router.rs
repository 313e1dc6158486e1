use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "Tutor scheduler is running!" }))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(config): State<Arc<AppConfig>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "supabase_configured": config.is_configured(),
        "redis_configured": config.is_redis_configured(),
        "default_timezone": config.default_timezone,
    }))
}
