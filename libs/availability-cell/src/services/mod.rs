pub mod availability;
pub mod interval;
pub mod slots;

pub use availability::AvailabilityService;
pub use interval::{Span, TimeInterval};
pub use slots::compute_available_slots;
