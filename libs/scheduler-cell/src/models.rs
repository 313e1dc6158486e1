use serde::{Deserialize, Serialize};

pub const PLANNER_JOB: &str = "generate_upcoming_lessons";
pub const REMINDER_JOB: &str = "send_lesson_reminders";

/// Result of a single-flight job invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Completed(T),
    /// Another invocation held the job lock.
    Skipped,
}

impl<T> JobOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::Skipped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderReport {
    pub lessons: usize,
    pub delivered: usize,
    pub failed: usize,
}
