use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{Actor, Role};

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub default_timezone: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            supabase_service_role_key: "test-service-key".to_string(),
            default_timezone: "Asia/Bangkok".to_string(),
        }
    }
}

impl TestConfig {
    pub fn with_supabase_url(url: impl Into<String>) -> Self {
        Self {
            supabase_url: url.into(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_role_key: self.supabase_service_role_key.clone(),
            default_timezone: self.default_timezone.clone(),
            ..AppConfig::default()
        }
    }
}

pub struct TestUser;

impl TestUser {
    pub fn actor(school_id: Uuid, role: Role) -> Actor {
        Actor::new(Uuid::new_v4(), school_id, role)
    }

    pub fn admin(school_id: Uuid) -> Actor {
        Self::actor(school_id, Role::Admin)
    }

    pub fn manager(school_id: Uuid) -> Actor {
        Self::actor(school_id, Role::Manager)
    }

    pub fn teacher(user_id: Uuid, school_id: Uuid) -> Actor {
        Actor::new(user_id, school_id, Role::Teacher)
    }

    pub fn student(user_id: Uuid, school_id: Uuid) -> Actor {
        Actor::new(user_id, school_id, Role::Student)
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

pub fn time(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).expect("valid test time")
}
