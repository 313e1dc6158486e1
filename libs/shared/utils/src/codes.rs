use std::collections::HashSet;

use rand::{distributions::Alphanumeric, Rng};
use tracing::debug;

/// Length of lesson, booking and availability codes.
pub const CODE_LENGTH: usize = 12;

pub fn generate_code(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Hands out codes that never repeat within a batch or against `seen`.
pub struct CodeGenerator {
    seen: HashSet<String>,
    length: usize,
}

impl CodeGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            seen: HashSet::new(),
            length,
        }
    }

    pub fn with_seen<I>(length: usize, existing: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            seen: existing.into_iter().collect(),
            length,
        }
    }

    pub fn next_unique(&mut self) -> String {
        loop {
            let code = generate_code(self.length);
            if self.seen.insert(code.clone()) {
                return code;
            }
            debug!("Code collision on {}, drawing again", code);
        }
    }

    /// Marks an externally chosen code as taken. Returns `false` if it already was.
    pub fn reserve(&mut self, code: &str) -> bool {
        self.seen.insert(code.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_alphanumeric_with_requested_length() {
        let code = generate_code(CODE_LENGTH);
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generator_never_repeats() {
        // Two-character codes collide often, forcing the redraw path.
        let mut generator = CodeGenerator::new(2);
        let mut drawn = HashSet::new();
        for _ in 0..500 {
            assert!(drawn.insert(generator.next_unique()));
        }
        assert_eq!(generator.len(), 500);
    }

    #[test]
    fn generator_skips_seeded_codes() {
        let mut generator = CodeGenerator::with_seen(CODE_LENGTH, vec!["AAAAAAAAAAAA".to_string()]);
        assert!(!generator.reserve("AAAAAAAAAAAA"));
        assert!(generator.reserve("BBBBBBBBBBBB"));
        assert_ne!(generator.next_unique(), "AAAAAAAAAAAA");
    }
}
