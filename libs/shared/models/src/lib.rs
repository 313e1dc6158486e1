pub mod error;
pub mod roles;

pub use error::AppError;
pub use roles::{Actor, Role};
