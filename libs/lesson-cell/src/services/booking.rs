use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use availability_cell::services::interval::{local_date, parse_timezone};
use availability_cell::{AvailabilityService, AvailabilityStore};
use shared_config::AppConfig;
use shared_database::locks::{acquire_with_retry, DistributedLock, DEFAULT_LOCK_ATTEMPTS};
use shared_models::{Actor, AppError, Role};
use shared_utils::codes::{generate_code, CODE_LENGTH};

use crate::models::{
    teacher_lock_key, AttendanceEvent, BookLessonRequest, Booking, BookingOutcome, BookingParty,
    BookingStatus, BookingTarget, BookingWrite, CancelOutcome, Course, CourseRegistration, Lesson,
    LessonChange, LessonStatus, LessonWrite, OpenGroupLessonRequest, PartyRequest, PaymentStatus,
    Teacher,
};
use crate::services::conflict::ConflictGuard;
use crate::services::ledger::CreditLedger;
use crate::services::lifecycle::LessonLifecycle;
use crate::services::notification::{
    dispatch, recipient_for, Notification, NotificationKind, Notifier, Recipient,
};
use crate::services::settings::SchedulingSettings;
use crate::store::LessonStore;

#[derive(Debug, Clone)]
pub struct BookingRules {
    pub lock_ttl: std::time::Duration,
    pub lock_attempts: u32,
    pub fallback_timezone: Tz,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            lock_ttl: std::time::Duration::from_secs(30),
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            fallback_timezone: Tz::Asia__Bangkok,
        }
    }
}

impl BookingRules {
    pub fn from_config(config: &AppConfig) -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: std::time::Duration::from_secs(config.lock_ttl_seconds),
            lock_attempts: defaults.lock_attempts,
            fallback_timezone: parse_timezone(Some(&config.default_timezone), defaults.fallback_timezone),
        }
    }
}

/// A lesson code or booking code resolved to its records.
struct Resolved {
    code: String,
    lesson: Lesson,
    bookings: Vec<Booking>,
    /// Set when the caller named a booking code.
    selected: Option<Uuid>,
}

impl Resolved {
    /// The booking the code refers to. A lesson code only names a booking
    /// when exactly one booking on the lesson still stands.
    fn booking(&self) -> Result<Option<Booking>, AppError> {
        if let Some(id) = self.selected {
            return Ok(self.bookings.iter().find(|b| b.id == id).cloned());
        }

        let standing: Vec<&Booking> = self.bookings.iter().filter(|b| b.is_standing()).collect();
        match standing.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some((*only).clone())),
            many => Err(AppError::Validation(format!(
                "lesson {} has {} bookings; use a booking code",
                self.code,
                many.len()
            ))),
        }
    }
}

/// Course, effective settings and teacher that govern one lesson.
struct LessonScope {
    course: Course,
    settings: SchedulingSettings,
    teacher: Option<Teacher>,
}

type Transition<T> = Result<(T, Vec<Notification>), AppError>;

/// Drives lessons and bookings through their lifecycle. Every transition
/// holds the teacher's scheduling lock from load to commit.
pub struct BookingService {
    store: Arc<dyn LessonStore>,
    availability: AvailabilityService,
    lock: Arc<dyn DistributedLock>,
    notifier: Arc<dyn Notifier>,
    rules: BookingRules,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn LessonStore>,
        availability_store: Arc<dyn AvailabilityStore>,
        lock: Arc<dyn DistributedLock>,
        notifier: Arc<dyn Notifier>,
        rules: BookingRules,
    ) -> Self {
        Self {
            store,
            availability: AvailabilityService::new(availability_store),
            lock,
            notifier,
            rules,
        }
    }

    // ==========================================================================
    // BOOKING
    // ==========================================================================

    #[instrument(skip(self, request), fields(actor = %actor.user_id, role = %actor.role))]
    pub async fn book(&self, actor: &Actor, request: BookLessonRequest) -> Result<BookingOutcome, AppError> {
        let key = match &request.target {
            BookingTarget::Existing { lesson_code } => self.lesson_by_code(lesson_code).await?.lock_key(),
            BookingTarget::NewSlot { teacher_id, .. } => teacher_lock_key(*teacher_id),
        };

        self.locked(&key, self.book_locked(actor, &request)).await
    }

    async fn book_locked(&self, actor: &Actor, request: &BookLessonRequest) -> Transition<BookingOutcome> {
        let now = Utc::now();

        let (lesson, is_new) = match &request.target {
            BookingTarget::Existing { lesson_code } => (self.lesson_by_code(lesson_code).await?, false),
            BookingTarget::NewSlot { teacher_id, course_id, start } => {
                let course = self.course(*course_id).await?;
                let lesson = Lesson {
                    id: Uuid::new_v4(),
                    code: self.fresh_code().await?,
                    school_id: course.school_id,
                    course_id: course.id,
                    teacher_id: Some(*teacher_id),
                    start: *start,
                    end: *start + Duration::minutes(course.duration),
                    status: LessonStatus::Available,
                    number_of_client: 0,
                    notified: false,
                };
                (lesson, true)
            }
        };

        let scope = self.scope(&lesson).await?;
        ensure_school(actor, &scope.course)?;

        if lesson.start <= now {
            return Err(AppError::Validation(format!("lesson {} has already started", lesson.code)));
        }

        let (party, registration) = self.party_for(actor, &request.party).await?;
        if let Some(registration) = &registration {
            check_registration(registration, &scope.course, &lesson, &scope.settings.timezone)?;
        }

        if scope.course.is_group {
            self.join_group(actor, lesson, is_new, &scope, party, now).await
        } else {
            self.book_private(actor, lesson, is_new, &scope, party, now).await
        }
    }

    async fn book_private(
        &self,
        actor: &Actor,
        mut lesson: Lesson,
        is_new: bool,
        scope: &LessonScope,
        party: BookingParty,
        now: DateTime<Utc>,
    ) -> Transition<BookingOutcome> {
        let teacher = scope
            .teacher
            .as_ref()
            .ok_or_else(|| AppError::Validation(format!("private lesson {} has no teacher", lesson.code)))?;
        ensure_teacher_scope(actor, Some(teacher))?;

        if !is_new && lesson.status != LessonStatus::Available {
            return Err(stale_lesson(&lesson));
        }

        if is_new && (teacher.school_id != scope.course.school_id || !teacher.teaches(scope.course.id)) {
            return Err(AppError::Validation(format!(
                "teacher {} does not teach {}",
                teacher.full_name(),
                scope.course.name
            )));
        }

        let target = if actor.role == Role::Student {
            LessonStatus::Pending
        } else {
            LessonStatus::Confirmed
        };
        let previous = lesson.status;
        LessonLifecycle::validate_transition(previous, target)?;

        let teacher_lessons = self.teacher_lessons_around(teacher.id, &lesson, &scope.settings).await?;
        ConflictGuard::assert_no_conflict(&lesson.span(), &teacher_lessons, Some(lesson.id))?;

        if target == LessonStatus::Pending {
            let date = local_date(&scope.settings.timezone, lesson.start);
            let context = self
                .availability
                .schedule_context(teacher.id, date, date, Vec::new())
                .await?;
            ConflictGuard::assert_within_availability(&lesson.span(), &context, &scope.settings.timezone)?;
        }

        let gap = scope.settings.teacher_break_minutes;
        let padded = lesson.span().extended_by(gap);
        let prune: Vec<Uuid> = teacher_lessons
            .iter()
            .filter(|other| other.status == LessonStatus::Available && other.id != lesson.id)
            .filter(|other| other.span().overlaps(&padded))
            .map(|other| other.id)
            .collect();

        lesson.status = target;
        lesson.number_of_client = 1;

        let booking = self.new_booking(&lesson, party, now).await?;

        let mut change = LessonChange::new(if is_new {
            LessonWrite::Insert { lesson: lesson.clone() }
        } else {
            LessonWrite::Update { lesson: lesson.clone(), expected: previous }
        });
        change.bookings.push(BookingWrite::Insert { booking: booking.clone() });
        change.prune_available = prune;

        let pruned = change.prune_available.len();
        self.store.commit(change).await?;

        info!(
            "Lesson {} booked as {} ({} overlapping slots withdrawn)",
            lesson.code, lesson.status, pruned
        );

        let mut notes = vec![note(NotificationKind::LessonBooked, Recipient::User(teacher.user_id), &lesson)];
        if target == LessonStatus::Confirmed {
            notes.extend(recipient_for(&booking).map(|r| note(NotificationKind::LessonConfirmed, r, &lesson)));
        }

        Ok((BookingOutcome { lesson, booking }, notes))
    }

    async fn join_group(
        &self,
        actor: &Actor,
        mut lesson: Lesson,
        is_new: bool,
        scope: &LessonScope,
        party: BookingParty,
        now: DateTime<Utc>,
    ) -> Transition<BookingOutcome> {
        if is_new {
            return Err(AppError::Validation(format!(
                "{} is a group course; book an open group lesson instead",
                scope.course.name
            )));
        }
        ensure_teacher_scope(actor, scope.teacher.as_ref())?;

        if lesson.status != LessonStatus::Confirmed {
            return Err(AppError::StaleState(format!(
                "group lesson {} is {}, not open for booking",
                lesson.code, lesson.status
            )));
        }
        if lesson.number_of_client >= scope.course.group_size {
            warn!("Group lesson {} is full ({}/{})", lesson.code, lesson.number_of_client, scope.course.group_size);
            return Err(AppError::SchedulingConflict(format!("lesson {} is full", lesson.code)));
        }

        if let BookingParty::Student { registration_uuid, .. } = &party {
            let existing = self.store.bookings_for_lesson(lesson.id).await?;
            if existing
                .iter()
                .any(|b| b.is_standing() && b.registration_uuid() == Some(*registration_uuid))
            {
                return Err(AppError::Validation(format!(
                    "registration {} already has a place in lesson {}",
                    registration_uuid, lesson.code
                )));
            }
        }

        lesson.number_of_client += 1;
        let booking = self.new_booking(&lesson, party, now).await?;

        let mut change = LessonChange::new(LessonWrite::Update {
            lesson: lesson.clone(),
            expected: LessonStatus::Confirmed,
        });
        change.bookings.push(BookingWrite::Insert { booking: booking.clone() });
        self.store.commit(change).await?;

        info!(
            "Booking {} joined group lesson {} ({}/{})",
            booking.code, lesson.code, lesson.number_of_client, scope.course.group_size
        );

        let notes = recipient_for(&booking)
            .map(|r| note(NotificationKind::LessonConfirmed, r, &lesson))
            .into_iter()
            .collect();

        Ok((BookingOutcome { lesson, booking }, notes))
    }

    /// Publish a CONFIRMED group lesson with no participants yet.
    pub async fn open_group_lesson(
        &self,
        actor: &Actor,
        request: OpenGroupLessonRequest,
    ) -> Result<Lesson, AppError> {
        ensure_staff(actor, "open a group lesson")?;
        let key = teacher_lock_key(request.teacher_id);
        self.locked(&key, self.open_group_locked(actor, &request)).await
    }

    async fn open_group_locked(&self, actor: &Actor, request: &OpenGroupLessonRequest) -> Transition<Lesson> {
        let course = self.course(request.course_id).await?;
        ensure_school(actor, &course)?;
        if !course.is_group {
            return Err(AppError::Validation(format!("{} is not a group course", course.name)));
        }

        let teacher = self.teacher(request.teacher_id).await?;
        ensure_teacher_scope(actor, Some(&teacher))?;
        if teacher.school_id != course.school_id || !teacher.teaches(course.id) {
            return Err(AppError::Validation(format!(
                "teacher {} does not teach {}",
                teacher.full_name(),
                course.name
            )));
        }
        if request.start <= Utc::now() {
            return Err(AppError::Validation("group lesson must start in the future".to_string()));
        }

        let lesson = Lesson {
            id: Uuid::new_v4(),
            code: self.fresh_code().await?,
            school_id: course.school_id,
            course_id: course.id,
            teacher_id: Some(teacher.id),
            start: request.start,
            end: request.start + Duration::minutes(course.duration),
            status: LessonStatus::Confirmed,
            number_of_client: 0,
            notified: false,
        };

        self.store
            .commit(LessonChange::new(LessonWrite::Insert { lesson: lesson.clone() }))
            .await?;
        info!("Opened group lesson {} for {}", lesson.code, course.name);

        Ok((lesson, Vec::new()))
    }

    // ==========================================================================
    // CONFIRM / CANCEL
    // ==========================================================================

    #[instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn confirm(&self, actor: &Actor, code: &str) -> Result<Lesson, AppError> {
        ensure_staff(actor, "confirm lessons")?;
        let key = self.resolve(code).await?.lesson.lock_key();
        self.locked(&key, self.confirm_locked(actor, code)).await
    }

    async fn confirm_locked(&self, actor: &Actor, code: &str) -> Transition<Lesson> {
        let Resolved { mut lesson, bookings, .. } = self.resolve(code).await?;
        let scope = self.scope(&lesson).await?;
        ensure_school(actor, &scope.course)?;
        ensure_teacher_scope(actor, scope.teacher.as_ref())?;

        if lesson.status != LessonStatus::Pending {
            return Err(AppError::StaleState(format!(
                "only pending lessons can be confirmed; lesson {} is {}",
                lesson.code, lesson.status
            )));
        }
        LessonLifecycle::validate_transition(lesson.status, LessonStatus::Confirmed)?;

        if let (Some(teacher), false) = (&scope.teacher, scope.course.is_group) {
            let teacher_lessons = self.teacher_lessons_around(teacher.id, &lesson, &scope.settings).await?;
            ConflictGuard::assert_no_conflict(&lesson.span(), &teacher_lessons, Some(lesson.id))?;
        }

        lesson.status = LessonStatus::Confirmed;
        self.store
            .commit(LessonChange::new(LessonWrite::Update {
                lesson: lesson.clone(),
                expected: LessonStatus::Pending,
            }))
            .await?;

        info!("Lesson {} confirmed", lesson.code);

        let notes = bookings
            .iter()
            .filter(|b| b.is_standing())
            .filter_map(recipient_for)
            .map(|r| note(NotificationKind::LessonConfirmed, r, &lesson))
            .collect();

        Ok((lesson, notes))
    }

    #[instrument(skip(self), fields(actor = %actor.user_id, role = %actor.role))]
    pub async fn cancel(&self, actor: &Actor, code: &str) -> Result<CancelOutcome, AppError> {
        let key = self.resolve(code).await?.lesson.lock_key();
        self.locked(&key, self.cancel_locked(actor, code)).await
    }

    async fn cancel_locked(&self, actor: &Actor, code: &str) -> Transition<CancelOutcome> {
        let resolved = self.resolve(code).await?;
        let scope = self.scope(&resolved.lesson).await?;
        ensure_school(actor, &scope.course)?;

        if actor.role == Role::Student {
            self.cancel_as_student(actor, resolved, &scope).await
        } else {
            ensure_teacher_scope(actor, scope.teacher.as_ref())?;
            self.cancel_as_staff(resolved, &scope).await
        }
    }

    async fn cancel_as_student(&self, actor: &Actor, resolved: Resolved, scope: &LessonScope) -> Transition<CancelOutcome> {
        let mut booking = resolved
            .booking()?
            .ok_or_else(|| AppError::Validation(format!("lesson {} has no booking to cancel", resolved.lesson.code)))?;
        let mut lesson = resolved.lesson;

        if booking.student_id() != Some(actor.user_id) {
            return Err(AppError::Forbidden("students may only cancel their own bookings".to_string()));
        }
        if !booking.is_standing() {
            return Err(AppError::StaleState(format!("booking {} is already canceled", booking.code)));
        }
        if !lesson.status.is_active() {
            return Err(AppError::StaleState(format!(
                "lesson {} is {} and can no longer be canceled",
                lesson.code, lesson.status
            )));
        }

        let previous = lesson.status;
        let late = Utc::now() > lesson.start - scope.settings.cancel_notice();

        let mut ledger = self.open_ledger(&booking).await?;
        let penalty_applied = match (&mut ledger, late) {
            (Some(ledger), true) => ledger.debit(&mut booking),
            _ => false,
        };

        booking.status = BookingStatus::Canceled;

        if scope.course.is_group {
            lesson.number_of_client = (lesson.number_of_client - 1).max(0);
        } else {
            LessonLifecycle::validate_transition(previous, LessonStatus::Canceled)?;
            lesson.status = LessonStatus::Canceled;
            lesson.number_of_client = 0;
        }

        let mut change = LessonChange::new(LessonWrite::Update { lesson: lesson.clone(), expected: previous });
        change.bookings.push(BookingWrite::Update { booking: booking.clone() });
        change.registrations.extend(ledger.and_then(CreditLedger::into_write));
        self.store.commit(change).await?;

        info!(
            "Booking {} canceled by student (late: {}, penalty: {})",
            booking.code, late, penalty_applied
        );

        let notes = scope
            .teacher
            .as_ref()
            .map(|t| note(NotificationKind::LessonCanceled, Recipient::User(t.user_id), &lesson))
            .into_iter()
            .collect();

        Ok((
            CancelOutcome {
                lesson,
                bookings: vec![booking],
                penalty_applied,
            },
            notes,
        ))
    }

    async fn cancel_as_staff(&self, resolved: Resolved, scope: &LessonScope) -> Transition<CancelOutcome> {
        let Resolved { mut lesson, bookings, .. } = resolved;
        let previous = lesson.status;
        LessonLifecycle::validate_transition(previous, LessonStatus::Canceled)?;

        let mut ledgers: HashMap<Uuid, CreditLedger> = HashMap::new();
        let mut canceled = Vec::new();

        for mut booking in bookings.into_iter().filter(Booking::is_standing) {
            if let Some(uuid) = booking.registration_uuid() {
                if booking.charged {
                    let ledger = match ledgers.entry(uuid) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => entry.insert(CreditLedger::open(self.registration(uuid).await?)),
                    };
                    ledger.credit(&mut booking);
                }
            }
            booking.status = BookingStatus::Canceled;
            canceled.push(booking);
        }

        lesson.status = LessonStatus::Canceled;
        lesson.number_of_client = 0;

        let mut change = LessonChange::new(LessonWrite::Update { lesson: lesson.clone(), expected: previous });
        change
            .bookings
            .extend(canceled.iter().cloned().map(|booking| BookingWrite::Update { booking }));
        change
            .registrations
            .extend(ledgers.into_values().filter_map(CreditLedger::into_write));
        self.store.commit(change).await?;

        info!("Lesson {} canceled by staff with {} bookings", lesson.code, canceled.len());

        let notes = canceled
            .iter()
            .filter_map(recipient_for)
            .map(|r| note(NotificationKind::LessonCanceled, r, &lesson))
            .collect();

        Ok((
            CancelOutcome {
                lesson,
                bookings: canceled,
                penalty_applied: false,
            },
            notes,
        ))
    }

    // ==========================================================================
    // ATTENDANCE
    // ==========================================================================

    pub async fn check_in(&self, actor: &Actor, code: &str, at: DateTime<Utc>) -> Result<BookingOutcome, AppError> {
        self.record(actor, code, AttendanceEvent::CheckIn(at)).await
    }

    pub async fn check_out(&self, actor: &Actor, code: &str, at: DateTime<Utc>) -> Result<BookingOutcome, AppError> {
        self.record(actor, code, AttendanceEvent::CheckOut(at)).await
    }

    pub async fn clear(&self, actor: &Actor, code: &str) -> Result<BookingOutcome, AppError> {
        self.record(actor, code, AttendanceEvent::Clear).await
    }

    pub async fn mark_missed(&self, actor: &Actor, code: &str, missed: bool) -> Result<BookingOutcome, AppError> {
        let event = if missed {
            AttendanceEvent::MarkMissed
        } else {
            AttendanceEvent::UnmarkMissed
        };
        self.record(actor, code, event).await
    }

    #[instrument(skip(self), fields(actor = %actor.user_id))]
    pub async fn record(&self, actor: &Actor, code: &str, event: AttendanceEvent) -> Result<BookingOutcome, AppError> {
        ensure_staff(actor, "record attendance")?;
        let key = self.resolve(code).await?.lesson.lock_key();
        self.locked(&key, self.record_locked(actor, code, event)).await
    }

    async fn record_locked(&self, actor: &Actor, code: &str, event: AttendanceEvent) -> Transition<BookingOutcome> {
        let resolved = self.resolve(code).await?;
        let scope = self.scope(&resolved.lesson).await?;
        ensure_school(actor, &scope.course)?;
        ensure_teacher_scope(actor, scope.teacher.as_ref())?;

        let mut booking = resolved
            .booking()?
            .ok_or_else(|| AppError::Validation(format!("lesson {} has no booking", resolved.lesson.code)))?;
        let Resolved { mut lesson, bookings, .. } = resolved;
        if !booking.is_standing() {
            return Err(AppError::StaleState(format!("booking {} is canceled", booking.code)));
        }

        let previous = lesson.status;
        let mut ledger = self.open_ledger(&booking).await?;
        // Group lessons stay open for attendance after the first check-out.
        let attendable = previous == LessonStatus::Confirmed
            || (scope.course.is_group && previous == LessonStatus::Completed);

        match event {
            AttendanceEvent::CheckIn(at) => {
                if !attendable {
                    return Err(stale_lesson(&lesson));
                }
                if booking.missed {
                    return Err(AppError::StaleState(format!("booking {} is marked missed", booking.code)));
                }
                if booking.check_in.is_some() {
                    return Err(AppError::StaleState(format!("booking {} is already checked in", booking.code)));
                }
                booking.check_in = Some(at);
            }
            AttendanceEvent::CheckOut(at) => {
                if !attendable {
                    return Err(stale_lesson(&lesson));
                }
                let checked_in = booking.check_in.ok_or_else(|| {
                    AppError::StaleState(format!("booking {} has not checked in", booking.code))
                })?;
                if booking.check_out.is_some() {
                    return Err(AppError::StaleState(format!("booking {} is already checked out", booking.code)));
                }
                if at < checked_in {
                    return Err(AppError::Validation(format!(
                        "check-out {} is before check-in {}",
                        at, checked_in
                    )));
                }
                booking.check_out = Some(at);
                if let Some(ledger) = ledger.as_mut() {
                    ledger.debit(&mut booking);
                }
                if previous == LessonStatus::Confirmed {
                    LessonLifecycle::validate_transition(previous, LessonStatus::Completed)?;
                    lesson.status = LessonStatus::Completed;
                }
            }
            AttendanceEvent::Clear => {
                if booking.check_out.is_none() {
                    return Err(AppError::StaleState(format!("booking {} has not checked out", booking.code)));
                }
                if let Some(ledger) = ledger.as_mut() {
                    ledger.credit(&mut booking);
                }
                booking.check_in = None;
                booking.check_out = None;

                let others_out = bookings
                    .iter()
                    .any(|b| b.id != booking.id && b.is_standing() && b.check_out.is_some());
                if previous == LessonStatus::Completed && !others_out {
                    LessonLifecycle::validate_transition(previous, LessonStatus::Confirmed)?;
                    lesson.status = LessonStatus::Confirmed;
                }
            }
            AttendanceEvent::MarkMissed => {
                if !attendable {
                    return Err(stale_lesson(&lesson));
                }
                if booking.missed {
                    return Err(AppError::StaleState(format!("booking {} is already marked missed", booking.code)));
                }
                if booking.check_in.is_some() {
                    return Err(AppError::StaleState(format!("booking {} has checked in", booking.code)));
                }
                if let Some(ledger) = ledger.as_mut() {
                    ledger.debit(&mut booking);
                }
                booking.missed = true;
                if !scope.course.is_group {
                    LessonLifecycle::validate_transition(previous, LessonStatus::Missed)?;
                    lesson.status = LessonStatus::Missed;
                }
            }
            AttendanceEvent::UnmarkMissed => {
                if !booking.missed {
                    return Err(AppError::StaleState(format!("booking {} is not marked missed", booking.code)));
                }
                if let Some(ledger) = ledger.as_mut() {
                    ledger.credit(&mut booking);
                }
                booking.missed = false;
                if previous == LessonStatus::Missed {
                    LessonLifecycle::validate_transition(previous, LessonStatus::Confirmed)?;
                    lesson.status = LessonStatus::Confirmed;
                }
            }
        }

        let mut change = LessonChange::new(LessonWrite::Update { lesson: lesson.clone(), expected: previous });
        change.bookings.push(BookingWrite::Update { booking: booking.clone() });
        change.registrations.extend(ledger.and_then(CreditLedger::into_write));
        self.store.commit(change).await?;

        info!("Recorded {:?} for booking {} (lesson {} now {})", event, booking.code, lesson.code, lesson.status);

        Ok((BookingOutcome { lesson, booking }, Vec::new()))
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    /// Run `transition` under the lock for `key`, then deliver its
    /// notifications once the lock is released.
    async fn locked<T, F>(&self, key: &str, transition: F) -> Result<T, AppError>
    where
        F: Future<Output = Transition<T>>,
    {
        let lease = acquire_with_retry(self.lock.as_ref(), key, self.rules.lock_ttl, self.rules.lock_attempts)
            .await
            .map_err(|e| AppError::Database(format!("scheduling lock {}: {}", key, e)))?
            .ok_or_else(|| {
                warn!("Could not acquire scheduling lock {}", key);
                AppError::SchedulingConflict("schedule is being changed by another request, try again".to_string())
            })?;

        let result = transition.await;

        if let Err(e) = self.lock.release(&lease).await {
            warn!("Failed to release scheduling lock {}: {}", key, e);
        }

        let (value, notes) = result?;
        dispatch(self.notifier.as_ref(), notes).await;
        Ok(value)
    }

    async fn resolve(&self, code: &str) -> Result<Resolved, AppError> {
        if let Some(found) = self.store.booking_by_code(code).await? {
            let lesson = self
                .store
                .lesson(found.lesson_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("lesson for booking {}", code)))?;
            let mut bookings = self.store.bookings_for_lesson(lesson.id).await?;
            if !bookings.iter().any(|b| b.id == found.id) {
                bookings.push(found.clone());
            }
            return Ok(Resolved {
                code: code.to_string(),
                lesson,
                bookings,
                selected: Some(found.id),
            });
        }

        let lesson = self.lesson_by_code(code).await?;
        let bookings = self.store.bookings_for_lesson(lesson.id).await?;
        debug!("Resolved {} to lesson {} with {} bookings", code, lesson.code, bookings.len());

        Ok(Resolved {
            code: code.to_string(),
            lesson,
            bookings,
            selected: None,
        })
    }

    async fn scope(&self, lesson: &Lesson) -> Result<LessonScope, AppError> {
        let course = self.course(lesson.course_id).await?;
        let school = self
            .store
            .school(course.school_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("school {}", course.school_id)))?;
        let settings = self.store.settings(school.id).await?;
        let settings = SchedulingSettings::resolve(&school, settings.as_ref(), self.rules.fallback_timezone);

        let teacher = match lesson.teacher_id {
            Some(id) => Some(self.teacher(id).await?),
            None => None,
        };

        Ok(LessonScope { course, settings, teacher })
    }

    async fn party_for(
        &self,
        actor: &Actor,
        request: &PartyRequest,
    ) -> Result<(BookingParty, Option<CourseRegistration>), AppError> {
        match request {
            PartyRequest::Registration { registration_uuid } => {
                let registration = self.registration(*registration_uuid).await?;
                if actor.role == Role::Student && registration.student_id != actor.user_id {
                    return Err(AppError::Forbidden("students may only book their own registrations".to_string()));
                }
                let party = BookingParty::Student {
                    student_id: registration.student_id,
                    registration_uuid: registration.uuid,
                };
                Ok((party, Some(registration)))
            }
            PartyRequest::Guest { name, email } => {
                ensure_staff(actor, "book guests")?;
                if name.trim().is_empty() {
                    return Err(AppError::Validation("guest name is required".to_string()));
                }
                let party = BookingParty::Guest {
                    name: name.trim().to_string(),
                    email: email.clone(),
                };
                Ok((party, None))
            }
        }
    }

    async fn teacher_lessons_around(
        &self,
        teacher_id: Uuid,
        lesson: &Lesson,
        settings: &SchedulingSettings,
    ) -> Result<Vec<Lesson>, AppError> {
        let gap = Duration::minutes(settings.teacher_break_minutes);
        self.store
            .lessons_for_teacher(teacher_id, lesson.start - gap, lesson.end + gap)
            .await
    }

    async fn open_ledger(&self, booking: &Booking) -> Result<Option<CreditLedger>, AppError> {
        match booking.registration_uuid() {
            Some(uuid) => Ok(Some(CreditLedger::open(self.registration(uuid).await?))),
            None => Ok(None),
        }
    }

    async fn new_booking(&self, lesson: &Lesson, party: BookingParty, now: DateTime<Utc>) -> Result<Booking, AppError> {
        Ok(Booking {
            id: Uuid::new_v4(),
            code: self.fresh_code().await?,
            lesson_id: lesson.id,
            party,
            status: BookingStatus::Completed,
            check_in: None,
            check_out: None,
            missed: false,
            charged: false,
            created_at: now,
        })
    }

    async fn fresh_code(&self) -> Result<String, AppError> {
        loop {
            let code = generate_code(CODE_LENGTH);
            if !self.store.code_exists(&code).await? {
                return Ok(code);
            }
            debug!("Code collision on {}, drawing again", code);
        }
    }

    async fn lesson_by_code(&self, code: &str) -> Result<Lesson, AppError> {
        self.store
            .lesson_by_code(code)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("lesson {}", code)))
    }

    async fn course(&self, id: Uuid) -> Result<Course, AppError> {
        self.store
            .course(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {}", id)))
    }

    async fn teacher(&self, id: Uuid) -> Result<Teacher, AppError> {
        self.store
            .teacher(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("teacher {}", id)))
    }

    async fn registration(&self, uuid: Uuid) -> Result<CourseRegistration, AppError> {
        self.store
            .registration(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("registration {}", uuid)))
    }
}

fn ensure_staff(actor: &Actor, action: &str) -> Result<(), AppError> {
    if !actor.is_staff() {
        return Err(AppError::Forbidden(format!("only staff may {}", action)));
    }
    Ok(())
}

fn ensure_school(actor: &Actor, course: &Course) -> Result<(), AppError> {
    if actor.school_id != course.school_id {
        return Err(AppError::Forbidden(format!("course {} belongs to another school", course.id)));
    }
    Ok(())
}

/// Teachers act only on their own lessons.
fn ensure_teacher_scope(actor: &Actor, teacher: Option<&Teacher>) -> Result<(), AppError> {
    if actor.role.is_school_wide() || !actor.is_staff() {
        return Ok(());
    }
    match teacher {
        Some(teacher) if teacher.user_id == actor.user_id => Ok(()),
        _ => Err(AppError::Forbidden("teachers may only manage their own lessons".to_string())),
    }
}

fn check_registration(
    registration: &CourseRegistration,
    course: &Course,
    lesson: &Lesson,
    tz: &Tz,
) -> Result<(), AppError> {
    if registration.course_id != course.id {
        return Err(AppError::Validation(format!(
            "registration {} is not for {}",
            registration.uuid, course.name
        )));
    }
    if registration.payment_status != PaymentStatus::Confirm {
        return Err(AppError::Validation(format!(
            "payment for registration {} is {}",
            registration.uuid, registration.payment_status
        )));
    }
    if registration.lessons_left <= 0 {
        return Err(AppError::Validation(format!(
            "registration {} has no lessons left",
            registration.uuid
        )));
    }
    let lesson_date = local_date(tz, lesson.start);
    if registration.is_expired_on(lesson_date) {
        return Err(AppError::Validation(format!(
            "registration {} expires before {}",
            registration.uuid, lesson_date
        )));
    }
    if !course.is_group {
        if let Some(teacher_id) = registration.teacher_id {
            if lesson.teacher_id != Some(teacher_id) {
                return Err(AppError::Validation(format!(
                    "registration {} is with a different teacher",
                    registration.uuid
                )));
            }
        }
    }
    Ok(())
}

fn stale_lesson(lesson: &Lesson) -> AppError {
    AppError::StaleState(format!("lesson {} is {}", lesson.code, lesson.status))
}

fn note(kind: NotificationKind, recipient: Recipient, lesson: &Lesson) -> Notification {
    Notification::for_lesson(kind, recipient, lesson)
}
