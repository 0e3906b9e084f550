//! lorafold optimizer - AdamW over named adapter parameters
//!
//! Explicit-gradient AdamW with global-norm clipping and a state that can
//! be exported next to a checkpoint, plus the learning-rate schedule.

pub mod adamw;
pub mod schedule;

pub use adamw::{global_norm, AdamW, AdamWConfig};
pub use schedule::LrSchedule;

/// lorafold-optim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
