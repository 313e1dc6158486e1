use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Booking, BookingParty, Lesson};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LessonBooked,
    LessonConfirmed,
    LessonCanceled,
    LessonReminder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    User(Uuid),
    Email(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Recipient,
    pub lesson_code: String,
    pub start: DateTime<Utc>,
}

impl Notification {
    pub fn for_lesson(kind: NotificationKind, recipient: Recipient, lesson: &Lesson) -> Self {
        Self {
            kind,
            recipient,
            lesson_code: lesson.code.clone(),
            start: lesson.start,
        }
    }
}

/// Who hears about a booking. Guests without an email get nothing.
pub fn recipient_for(booking: &Booking) -> Option<Recipient> {
    match &booking.party {
        BookingParty::Student { student_id, .. } => Some(Recipient::User(*student_id)),
        BookingParty::Guest { email, .. } => email.clone().map(Recipient::Email),
    }
}

/// Delivery channel (push, SMS, email) behind a fire-and-forget seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log; used when no channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            "Notification {:?} for {:?}: lesson {} at {}",
            notification.kind, notification.recipient, notification.lesson_code, notification.start
        );
        Ok(())
    }
}

/// Send every notification; failures are logged and never reach the caller.
pub async fn dispatch(notifier: &dyn Notifier, notifications: Vec<Notification>) -> usize {
    let mut delivered = 0;
    for notification in notifications {
        match notifier.send(&notification).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!(
                "Failed to deliver {:?} for lesson {}: {}",
                notification.kind, notification.lesson_code, e
            ),
        }
    }
    delivered
}
