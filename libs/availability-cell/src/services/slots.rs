use chrono::Duration;
use tracing::debug;

use shared_models::AppError;

use crate::models::{Slot, SlotQuery};
use crate::services::interval::{coalesce, is_clear, localize, Span};

/// Bookable starts inside one availability window on one date.
///
/// Candidates step from the window start by `step_minutes` and must fit
/// entirely before the window stop. A candidate survives when it overlaps no
/// unavailability interval of the date and no booked lesson extended by the
/// teacher's break. The result is sorted and depends only on the inputs.
pub fn compute_available_slots(query: &SlotQuery<'_>) -> Result<Vec<Slot>, AppError> {
    if query.duration_minutes <= 0 {
        return Err(AppError::Validation(format!(
            "lesson duration must be positive, got {}",
            query.duration_minutes
        )));
    }
    if query.step_minutes <= 0 {
        return Err(AppError::Validation(format!(
            "slot interval must be positive, got {}",
            query.step_minutes
        )));
    }
    if query.gap_minutes < 0 {
        return Err(AppError::Validation(format!(
            "teacher break cannot be negative, got {}",
            query.gap_minutes
        )));
    }

    let tz = &query.timezone;
    let window_start = localize(tz, query.date, query.window_start);
    let window_stop = localize(tz, query.date, query.window_stop);

    if window_start >= window_stop {
        return Ok(Vec::new());
    }

    let unavailable = coalesce(
        query
            .unavailable
            .iter()
            .filter(|interval| interval.date() == query.date)
            .map(|interval| interval.anchor(tz))
            .collect(),
    );

    let occupied = coalesce(
        query
            .booked
            .iter()
            .map(|lesson| Span::new(lesson.start, lesson.end).extended_by(query.gap_minutes))
            .collect(),
    );

    let duration = Duration::minutes(query.duration_minutes);
    let step = Duration::minutes(query.step_minutes);

    let mut slots = Vec::new();
    let mut candidate = window_start;

    while candidate + duration <= window_stop {
        let span = Span::new(candidate, candidate + duration);
        if is_clear(&unavailable, &span) && is_clear(&occupied, &span) {
            slots.push(Slot { start: span.start, end: span.stop });
        }
        candidate += step;
    }

    debug!(
        "Computed {} slots on {} between {} and {}",
        slots.len(),
        query.date,
        query.window_start,
        query.window_stop
    );

    Ok(slots)
}
