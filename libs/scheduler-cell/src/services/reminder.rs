use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use lesson_cell::{
    dispatch, recipient_for, Lesson, LessonStore, Notification, NotificationKind, Notifier, Recipient,
};
use shared_models::AppError;

use crate::models::ReminderReport;

/// Notifies teachers and students ahead of confirmed lessons, once per lesson.
pub struct ReminderService {
    store: Arc<dyn LessonStore>,
    notifier: Arc<dyn Notifier>,
    lead: Duration,
}

impl ReminderService {
    pub fn new(store: Arc<dyn LessonStore>, notifier: Arc<dyn Notifier>, lead: Duration) -> Self {
        Self { store, notifier, lead }
    }

    #[instrument(skip(self))]
    pub async fn send_due_reminders(&self, now: DateTime<Utc>) -> Result<ReminderReport, AppError> {
        let due = self.store.due_for_reminder(now, now + self.lead).await?;
        let mut report = ReminderReport {
            lessons: due.len(),
            ..ReminderReport::default()
        };

        for lesson in due {
            let notifications = self.notifications_for(&lesson).await?;
            let total = notifications.len();
            let delivered = dispatch(self.notifier.as_ref(), notifications).await;

            report.delivered += delivered;
            report.failed += total - delivered;

            self.store.mark_notified(lesson.id).await?;
            debug!("Reminded {} recipients of lesson {}", delivered, lesson.code);
        }

        if report.lessons > 0 {
            info!(
                "Sent reminders for {} lessons ({} delivered, {} failed)",
                report.lessons, report.delivered, report.failed
            );
        }
        Ok(report)
    }

    async fn notifications_for(&self, lesson: &Lesson) -> Result<Vec<Notification>, AppError> {
        let mut recipients = Vec::new();

        if let Some(teacher_id) = lesson.teacher_id {
            match self.store.teacher(teacher_id).await? {
                Some(teacher) => recipients.push(Recipient::User(teacher.user_id)),
                None => warn!("Lesson {} references missing teacher {}", lesson.code, teacher_id),
            }
        }

        let bookings = self.store.bookings_for_lesson(lesson.id).await?;
        recipients.extend(bookings.iter().filter(|b| b.is_standing()).filter_map(recipient_for));

        Ok(recipients
            .into_iter()
            .map(|recipient| Notification::for_lesson(NotificationKind::LessonReminder, recipient, lesson))
            .collect())
    }
}
