pub mod codes;
pub mod test_utils;

pub use codes::{generate_code, CodeGenerator, CODE_LENGTH};
