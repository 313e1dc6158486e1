use tracing::{debug, warn};

use shared_models::AppError;

use crate::models::LessonStatus;

pub struct LessonLifecycle;

impl LessonLifecycle {
    /// Validate that a status transition is allowed
    pub fn validate_transition(current: LessonStatus, next: LessonStatus) -> Result<(), AppError> {
        if !Self::valid_transitions(current).contains(&next) {
            warn!("Invalid lesson transition attempted: {} -> {}", current, next);
            return Err(AppError::StaleState(format!(
                "lesson cannot move from {} to {}",
                current, next
            )));
        }

        debug!("Lesson transition validated: {} -> {}", current, next);
        Ok(())
    }

    /// Get all valid next statuses for a given current status
    pub fn valid_transitions(current: LessonStatus) -> Vec<LessonStatus> {
        match current {
            LessonStatus::Available => vec![
                LessonStatus::Pending,
                LessonStatus::Confirmed,
                LessonStatus::Canceled,
            ],
            LessonStatus::Pending => vec![
                LessonStatus::Confirmed,
                LessonStatus::Canceled,
            ],
            LessonStatus::Confirmed => vec![
                LessonStatus::Completed,
                LessonStatus::Canceled,
                LessonStatus::Missed,
            ],
            // Reopened by clearing a check-out
            LessonStatus::Completed => vec![LessonStatus::Confirmed],
            // Reopened by un-marking
            LessonStatus::Missed => vec![LessonStatus::Confirmed],
            LessonStatus::Canceled => vec![],
        }
    }

    pub fn is_terminal(status: LessonStatus) -> bool {
        Self::valid_transitions(status).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn booking_paths_from_available() {
        assert!(LessonLifecycle::validate_transition(LessonStatus::Available, LessonStatus::Pending).is_ok());
        assert!(LessonLifecycle::validate_transition(LessonStatus::Available, LessonStatus::Confirmed).is_ok());
        assert!(LessonLifecycle::validate_transition(LessonStatus::Pending, LessonStatus::Confirmed).is_ok());
    }

    #[test]
    fn completed_and_missed_only_reopen() {
        assert_eq!(LessonLifecycle::valid_transitions(LessonStatus::Completed), vec![LessonStatus::Confirmed]);
        assert_eq!(LessonLifecycle::valid_transitions(LessonStatus::Missed), vec![LessonStatus::Confirmed]);
        assert_matches!(
            LessonLifecycle::validate_transition(LessonStatus::Completed, LessonStatus::Canceled),
            Err(AppError::StaleState(_))
        );
    }

    #[test]
    fn canceled_is_terminal() {
        assert!(LessonLifecycle::is_terminal(LessonStatus::Canceled));
        assert!(!LessonLifecycle::is_terminal(LessonStatus::Missed));
        assert_matches!(
            LessonLifecycle::validate_transition(LessonStatus::Canceled, LessonStatus::Confirmed),
            Err(AppError::StaleState(_))
        );
    }

    #[test]
    fn pending_cannot_complete_directly() {
        assert_matches!(
            LessonLifecycle::validate_transition(LessonStatus::Pending, LessonStatus::Completed),
            Err(AppError::StaleState(_))
        );
    }
}
