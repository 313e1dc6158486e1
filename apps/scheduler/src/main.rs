use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use availability_cell::SupabaseAvailabilityStore;
use availability_cell::services::interval::parse_timezone;
use lesson_cell::{LogNotifier, PlannerService, SupabaseLessonStore};
use scheduler_cell::{JobRunner, JobScheduler, RedisLock, ReminderService};
use shared_config::{AppConfig, DEFAULT_TIMEZONE};
use shared_database::{DistributedLock, LocalLock, SupabaseClient, SupabaseLock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tutor scheduler");

    let config = AppConfig::from_env();
    let fallback_tz = parse_timezone(Some(&config.default_timezone), chrono_tz::Asia::Bangkok);
    if fallback_tz.name() != config.default_timezone {
        warn!(
            "Unknown default timezone '{}', falling back to {}",
            config.default_timezone, DEFAULT_TIMEZONE
        );
    }

    let supabase = Arc::new(SupabaseClient::new(&config));
    let lessons = Arc::new(SupabaseLessonStore::new(supabase.clone()));
    let availability = Arc::new(SupabaseAvailabilityStore::new(supabase.clone()));
    let lock = scheduling_lock(&config, supabase.clone()).await;
    let job_ttl = Duration::from_secs(config.job_lock_ttl_seconds);

    let scheduler = Arc::new(JobScheduler::new(
        JobRunner::new(lock, job_ttl),
        PlannerService::new(lessons.clone(), availability, fallback_tz),
        ReminderService::new(
            lessons,
            Arc::new(LogNotifier),
            chrono::Duration::minutes(config.reminder_lead_minutes),
        ),
        Duration::from_secs(config.planner_interval_hours * 3600),
        Duration::from_secs(config.reminder_interval_minutes * 60),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = scheduler.spawn(shutdown_rx);

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(Arc::new(config.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    futures::future::join_all(jobs).await;
    info!("Tutor scheduler stopped");

    Ok(())
}

async fn scheduling_lock(config: &AppConfig, supabase: Arc<SupabaseClient>) -> Arc<dyn DistributedLock> {
    if config.is_redis_configured() {
        match RedisLock::new(config).await {
            Ok(lock) => return Arc::new(lock),
            Err(e) => warn!("Redis unavailable ({}), using the database lock table", e),
        }
    }

    if config.is_configured() {
        info!("Using database scheduling lock");
        Arc::new(SupabaseLock::new(supabase))
    } else {
        warn!("No shared store configured, scheduling locks are process-local");
        Arc::new(LocalLock::new())
    }
}
