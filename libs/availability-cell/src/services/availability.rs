use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_models::AppError;
use shared_utils::codes::{generate_code, CODE_LENGTH};

use crate::models::{
    weekday_from_iso, BookedSpan, ChangeOutcome, NewException, TeacherScheduleContext,
    UnavailabilityException, WeeklyAvailability, WeeklyChange, WeeklyChangeResult,
};
use crate::services::interval::TimeInterval;
use crate::store::AvailabilityStore;

pub struct AvailabilityService {
    store: Arc<dyn AvailabilityStore>,
}

impl AvailabilityService {
    pub fn new(store: Arc<dyn AvailabilityStore>) -> Self {
        Self { store }
    }

    /// Apply a mixed batch of creates, updates and deletes. Each entry stands
    /// alone: a rejected entry is reported and the rest still apply.
    pub async fn apply_weekly_changes(
        &self,
        teacher_id: Uuid,
        changes: Vec<WeeklyChange>,
    ) -> Result<Vec<WeeklyChangeResult>, AppError> {
        debug!("Applying {} weekly availability changes for teacher {}", changes.len(), teacher_id);

        let mut results = Vec::with_capacity(changes.len());

        for (index, change) in changes.into_iter().enumerate() {
            let result = match self.apply_one(teacher_id, change).await {
                Ok(code) => WeeklyChangeResult {
                    index,
                    code: Some(code),
                    outcome: ChangeOutcome::Applied,
                },
                Err(e @ AppError::Database(_)) | Err(e @ AppError::Internal(_)) => return Err(e),
                Err(e) => {
                    warn!("Weekly availability change {} rejected: {}", index, e);
                    WeeklyChangeResult {
                        index,
                        code: None,
                        outcome: ChangeOutcome::Rejected(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let applied = results.iter().filter(|r| r.is_applied()).count();
        info!("Teacher {} availability batch: {} applied, {} rejected",
              teacher_id, applied, results.len() - applied);

        Ok(results)
    }

    async fn apply_one(&self, teacher_id: Uuid, change: WeeklyChange) -> Result<String, AppError> {
        match change {
            WeeklyChange::Create { day, start, stop } => {
                validate_window(day, start, stop)?;
                let availability = WeeklyAvailability {
                    id: Uuid::new_v4(),
                    teacher_id,
                    day,
                    start,
                    stop,
                    code: generate_code(CODE_LENGTH),
                };
                self.store.insert_weekly(&availability).await?;
                Ok(availability.code)
            }
            WeeklyChange::Update { code, day, start, stop } => {
                validate_window(day, start, stop)?;
                let mut availability = self.owned_weekly(teacher_id, &code).await?;
                availability.day = day;
                availability.start = start;
                availability.stop = stop;
                self.store.update_weekly(&availability).await?;
                Ok(code)
            }
            WeeklyChange::Delete { code } => {
                self.owned_weekly(teacher_id, &code).await?;
                self.store.delete_weekly(&code).await?;
                Ok(code)
            }
        }
    }

    async fn owned_weekly(&self, teacher_id: Uuid, code: &str) -> Result<WeeklyAvailability, AppError> {
        match self.store.weekly_by_code(code).await? {
            Some(availability) if availability.teacher_id == teacher_id => Ok(availability),
            Some(_) => Err(AppError::Forbidden(format!("availability {} belongs to another teacher", code))),
            None => Err(AppError::NotFound(format!("availability {}", code))),
        }
    }

    pub async fn list_weekly(&self, teacher_id: Uuid) -> Result<Vec<WeeklyAvailability>, AppError> {
        self.store.weekly_for_teacher(teacher_id).await
    }

    /// Record a one-off absence, folding in any exception of the same date it
    /// overlaps or touches.
    pub async fn add_exception(
        &self,
        teacher_id: Uuid,
        request: NewException,
    ) -> Result<UnavailabilityException, AppError> {
        let mut merged = TimeInterval::new(request.date, request.start, request.stop)?;

        let same_day = self
            .store
            .exceptions_for_teacher(teacher_id, request.date, request.date)
            .await?;

        let mut absorbed = Vec::new();
        // Growing the interval can bring earlier-skipped neighbours into reach.
        loop {
            let before = absorbed.len();
            for existing in &same_day {
                if absorbed.contains(&existing.code) {
                    continue;
                }
                if let Some(interval) = existing.interval() {
                    if interval.touches(&merged) {
                        merged = merged.union(&interval);
                        absorbed.push(existing.code.clone());
                    }
                }
            }
            if absorbed.len() == before {
                break;
            }
        }

        let exception = UnavailabilityException {
            id: Uuid::new_v4(),
            teacher_id,
            date: merged.date(),
            start: merged.start(),
            stop: merged.stop(),
            code: generate_code(CODE_LENGTH),
        };

        self.store.replace_exceptions(&absorbed, &exception).await?;

        info!("Teacher {} unavailable {} {}-{} ({} merged)",
              teacher_id, exception.date, exception.start, exception.stop, absorbed.len());

        Ok(exception)
    }

    pub async fn remove_exception(&self, teacher_id: Uuid, code: &str) -> Result<(), AppError> {
        match self.store.exception_by_code(code).await? {
            Some(exception) if exception.teacher_id == teacher_id => {
                self.store.delete_exception(code).await?;
                debug!("Removed exception {} for teacher {}", code, teacher_id);
                Ok(())
            }
            Some(_) => Err(AppError::Forbidden(format!("exception {} belongs to another teacher", code))),
            None => Err(AppError::NotFound(format!("exception {}", code))),
        }
    }

    pub async fn list_exceptions(
        &self,
        teacher_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UnavailabilityException>, AppError> {
        if from > to {
            return Err(AppError::Validation(format!("range start {} is after end {}", from, to)));
        }
        self.store.exceptions_for_teacher(teacher_id, from, to).await
    }

    /// Load a teacher's recurring windows and exceptions for `[from, to]`.
    pub async fn schedule_context(
        &self,
        teacher_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        booked: Vec<BookedSpan>,
    ) -> Result<TeacherScheduleContext, AppError> {
        let weekly = self.store.weekly_for_teacher(teacher_id).await?;
        let exceptions = self.store.exceptions_for_teacher(teacher_id, from, to).await?;

        Ok(TeacherScheduleContext {
            teacher_id,
            weekly,
            exceptions,
            booked,
        })
    }
}

fn validate_window(day: u8, start: NaiveTime, stop: NaiveTime) -> Result<(), AppError> {
    if weekday_from_iso(day).is_none() {
        return Err(AppError::Validation(format!("day must be between 1 (Monday) and 7 (Sunday), got {}", day)));
    }
    if start >= stop {
        return Err(AppError::Validation(format!(
            "start {} must be before stop {}",
            start.format("%H:%M"),
            stop.format("%H:%M")
        )));
    }
    Ok(())
}
