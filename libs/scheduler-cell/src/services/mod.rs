pub mod periodic;
pub mod redis_lock;
pub mod reminder;
pub mod runner;

pub use periodic::{spawn_periodic, JobScheduler};
pub use redis_lock::RedisLock;
pub use reminder::ReminderService;
pub use runner::JobRunner;
