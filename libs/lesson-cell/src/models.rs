use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use availability_cell::services::interval::Span;

// ==============================================================================
// SCHOOL
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: Uuid,
    pub name: String,
    pub location: Option<String>,
    /// IANA zone name; the configured default applies when absent.
    pub timezone: Option<String>,
}

/// Per-school scheduling knobs. Missing fields take the defaults in
/// `services::settings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolSettings {
    pub school_id: Uuid,
    pub days_ahead: Option<i64>,
    pub interval: Option<i64>,
    pub cancel_b4_hours: Option<i64>,
    pub teacher_break: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub capacity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: Uuid,
    pub user_id: Uuid,
    pub school_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub profile_image: Option<String>,
    #[serde(default)]
    pub course_ids: Vec<Uuid>,
}

impl Teacher {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    pub fn teaches(&self, course_id: Uuid) -> bool {
        self.course_ids.contains(&course_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Lesson length in minutes.
    pub duration: i64,
    pub is_group: bool,
    pub group_size: i64,
    pub price: f64,
    pub no_exp: bool,
    /// Months a registration stays valid when `no_exp` is false.
    pub exp_range: i64,
    pub number_of_lessons: i64,
}

// ==============================================================================
// REGISTRATION
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Waiting,
    Confirm,
    Denied,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Waiting => write!(f, "waiting"),
            PaymentStatus::Confirm => write!(f, "confirm"),
            PaymentStatus::Denied => write!(f, "denied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRegistration {
    pub uuid: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    /// Set for private courses; group registrations follow the course.
    pub teacher_id: Option<Uuid>,
    pub registered_date: NaiveDate,
    pub lessons_left: i64,
    pub exp_date: Option<NaiveDate>,
    pub payment_status: PaymentStatus,
}

impl CourseRegistration {
    pub fn is_expired_on(&self, date: NaiveDate) -> bool {
        self.exp_date.map(|exp| date > exp).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRegistration {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub teacher_id: Option<Uuid>,
    pub registered_date: NaiveDate,
    pub lessons_override: Option<i64>,
    pub payment_status: PaymentStatus,
}

// ==============================================================================
// LESSON
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonStatus {
    Available,
    Pending,
    Confirmed,
    Completed,
    Canceled,
    Missed,
}

impl LessonStatus {
    /// Statuses that hold the teacher's time.
    pub fn is_active(&self) -> bool {
        matches!(self, LessonStatus::Pending | LessonStatus::Confirmed)
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LessonStatus::Available => write!(f, "available"),
            LessonStatus::Pending => write!(f, "pending"),
            LessonStatus::Confirmed => write!(f, "confirmed"),
            LessonStatus::Completed => write!(f, "completed"),
            LessonStatus::Canceled => write!(f, "canceled"),
            LessonStatus::Missed => write!(f, "missed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Uuid,
    pub code: String,
    pub school_id: Uuid,
    pub course_id: Uuid,
    pub teacher_id: Option<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: LessonStatus,
    pub number_of_client: i64,
    pub notified: bool,
}

impl Lesson {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn overlaps(&self, other: &Lesson) -> bool {
        self.span().overlaps(&other.span())
    }

    pub fn lock_key(&self) -> String {
        match self.teacher_id {
            Some(teacher_id) => teacher_lock_key(teacher_id),
            None => format!("lesson:{}", self.code),
        }
    }
}

pub fn teacher_lock_key(teacher_id: Uuid) -> String {
    format!("teacher:{}", teacher_id)
}

// ==============================================================================
// BOOKING
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// The booking stands.
    Completed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingParty {
    Student {
        student_id: Uuid,
        registration_uuid: Uuid,
    },
    Guest {
        name: String,
        email: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub code: String,
    pub lesson_id: Uuid,
    pub party: BookingParty,
    pub status: BookingStatus,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub missed: bool,
    /// Whether this booking currently holds one lesson of credit.
    pub charged: bool,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_standing(&self) -> bool {
        self.status == BookingStatus::Completed
    }

    pub fn registration_uuid(&self) -> Option<Uuid> {
        match &self.party {
            BookingParty::Student { registration_uuid, .. } => Some(*registration_uuid),
            BookingParty::Guest { .. } => None,
        }
    }

    pub fn student_id(&self) -> Option<Uuid> {
        match &self.party {
            BookingParty::Student { student_id, .. } => Some(*student_id),
            BookingParty::Guest { .. } => None,
        }
    }
}

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingTarget {
    /// A lesson that already exists: a speculative slot or an open group lesson.
    Existing { lesson_code: String },
    NewSlot {
        teacher_id: Uuid,
        course_id: Uuid,
        start: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartyRequest {
    Registration { registration_uuid: Uuid },
    Guest { name: String, email: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLessonRequest {
    pub target: BookingTarget,
    pub party: PartyRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenGroupLessonRequest {
    pub teacher_id: Uuid,
    pub course_id: Uuid,
    pub start: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingOutcome {
    pub lesson: Lesson,
    pub booking: Booking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub lesson: Lesson,
    /// Bookings canceled by this call.
    pub bookings: Vec<Booking>,
    /// A late student cancellation cost one lesson of credit.
    pub penalty_applied: bool,
}

/// Attendance events recorded against a single booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "at", rename_all = "snake_case")]
pub enum AttendanceEvent {
    CheckIn(DateTime<Utc>),
    CheckOut(DateTime<Utc>),
    Clear,
    MarkMissed,
    UnmarkMissed,
}

// ==============================================================================
// UNIT OF WORK
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LessonWrite {
    Insert { lesson: Lesson },
    /// Applies only if the stored lesson still has `expected` status.
    Update { lesson: Lesson, expected: LessonStatus },
}

impl LessonWrite {
    pub fn lesson(&self) -> &Lesson {
        match self {
            LessonWrite::Insert { lesson } | LessonWrite::Update { lesson, .. } => lesson,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BookingWrite {
    Insert { booking: Booking },
    Update { booking: Booking },
}

/// Compare-and-set on a registration's credit balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationWrite {
    pub uuid: Uuid,
    pub expected_lessons_left: i64,
    pub lessons_left: i64,
}

/// Everything one transition writes, committed atomically or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonChange {
    pub lesson: LessonWrite,
    pub bookings: Vec<BookingWrite>,
    pub registrations: Vec<RegistrationWrite>,
    /// AVAILABLE lessons superseded by this change.
    pub prune_available: Vec<Uuid>,
}

impl LessonChange {
    pub fn new(lesson: LessonWrite) -> Self {
        Self {
            lesson,
            bookings: Vec::new(),
            registrations: Vec::new(),
            prune_available: Vec::new(),
        }
    }
}

// ==============================================================================
// PLANNING
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerReport {
    pub school_id: Uuid,
    pub generated: usize,
    pub dropped_for_capacity: usize,
    pub duplicates_skipped: usize,
    pub cleared: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedLesson {
    pub datetime: DateTime<Utc>,
}

/// Bookable times for one of a student's registrations, with the display
/// details a client needs to render them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPlan {
    pub course_name: String,
    pub course_description: Option<String>,
    pub registration_uuid: Uuid,
    pub instructor_picture: Option<String>,
    pub instructor_name: String,
    pub instructor_phone_number: Option<String>,
    pub instructor_email: Option<String>,
    pub lesson_duration: i64,
    pub location: Option<String>,
    pub lessons: Vec<PlannedLesson>,
}
