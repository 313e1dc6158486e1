pub mod booking;
pub mod conflict;
pub mod ledger;
pub mod lifecycle;
pub mod notification;
pub mod planner;
pub mod registration;
pub mod settings;

pub use booking::{BookingRules, BookingService};
pub use conflict::ConflictGuard;
pub use ledger::CreditLedger;
pub use lifecycle::LessonLifecycle;
pub use notification::{dispatch, recipient_for, LogNotifier, Notification, NotificationKind, Notifier, Recipient};
pub use planner::PlannerService;
pub use registration::RegistrationService;
pub use settings::SchedulingSettings;
