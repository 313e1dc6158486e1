use std::env;
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_TIMEZONE: &str = "Asia/Bangkok";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub redis_url: Option<String>,
    pub default_timezone: String,
    pub planner_interval_hours: u64,
    pub reminder_interval_minutes: u64,
    pub reminder_lead_minutes: i64,
    pub lock_ttl_seconds: u64,
    pub job_lock_ttl_seconds: u64,
    pub http_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_service_role_key: String::new(),
            redis_url: None,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            planner_interval_hours: 24,
            reminder_interval_minutes: 5,
            reminder_lead_minutes: 60,
            lock_ttl_seconds: 30,
            job_lock_ttl_seconds: 600,
            http_port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, requests will use the anon key");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            default_timezone: env::var("SCHEDULER_DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| {
                    warn!("SCHEDULER_DEFAULT_TIMEZONE not set, using default");
                    defaults.default_timezone.clone()
                }),
            planner_interval_hours: parse_nonzero_or(
                "PLANNER_INTERVAL_HOURS",
                env::var("PLANNER_INTERVAL_HOURS").ok(),
                defaults.planner_interval_hours,
            ),
            reminder_interval_minutes: parse_nonzero_or(
                "REMINDER_INTERVAL_MINUTES",
                env::var("REMINDER_INTERVAL_MINUTES").ok(),
                defaults.reminder_interval_minutes,
            ),
            reminder_lead_minutes: parse_or(
                "REMINDER_LEAD_MINUTES",
                env::var("REMINDER_LEAD_MINUTES").ok(),
                defaults.reminder_lead_minutes,
            ),
            lock_ttl_seconds: parse_nonzero_or(
                "SCHEDULING_LOCK_TTL_SECONDS",
                env::var("SCHEDULING_LOCK_TTL_SECONDS").ok(),
                defaults.lock_ttl_seconds,
            ),
            job_lock_ttl_seconds: parse_nonzero_or(
                "JOB_LOCK_TTL_SECONDS",
                env::var("JOB_LOCK_TTL_SECONDS").ok(),
                defaults.job_lock_ttl_seconds,
            ),
            http_port: parse_or("HTTP_PORT", env::var("HTTP_PORT").ok(), defaults.http_port),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_redis_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn parse_or<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, value, default);
            default
        }),
        None => default,
    }
}

/// Like `parse_or`, but zero also falls back to the default.
fn parse_nonzero_or<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Copy + Default + PartialEq + std::fmt::Display,
{
    let value = parse_or(name, raw, default);
    if value == T::default() {
        warn!("{} must be greater than zero, using default {}", name, default);
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_uses_value_when_valid() {
        assert_eq!(parse_or("X", Some(" 12 ".to_string()), 3u64), 12);
    }

    #[test]
    fn parse_or_falls_back_on_garbage_or_missing() {
        assert_eq!(parse_or("X", Some("soon".to_string()), 24u64), 24);
        assert_eq!(parse_or("X", None, 60i64), 60);
    }

    #[test]
    fn parse_nonzero_or_rejects_zero() {
        assert_eq!(parse_nonzero_or("PLANNER_INTERVAL_HOURS", Some("0".to_string()), 24u64), 24);
        assert_eq!(parse_nonzero_or("REMINDER_INTERVAL_MINUTES", Some(" 0 ".to_string()), 5u64), 5);
        assert_eq!(parse_nonzero_or("JOB_LOCK_TTL_SECONDS", Some("120".to_string()), 600u64), 120);
    }

    #[test]
    fn default_config_is_not_configured() {
        let config = AppConfig::default();
        assert!(!config.is_configured());
        assert!(!config.is_redis_configured());
        assert_eq!(config.default_timezone, DEFAULT_TIMEZONE);
    }
}
