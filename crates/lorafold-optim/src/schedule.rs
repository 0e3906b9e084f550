//! Learning-rate schedule: linear warmup, then linear decay

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub warmup_steps: usize,
    /// Total optimizer steps of the run. `None` keeps the rate flat after warmup.
    pub total_steps: Option<usize>,
}

impl LrSchedule {
    pub fn constant(base_lr: f64) -> Self {
        Self {
            base_lr,
            warmup_steps: 0,
            total_steps: None,
        }
    }

    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: Option<usize>) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Rate for 1-based optimizer step `step`. Never zero inside the run.
    pub fn lr_at(&self, step: usize) -> f64 {
        let step = step.max(1);
        if step <= self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }

        match self.total_steps {
            Some(total) if total > self.warmup_steps => {
                let remaining = total.saturating_sub(step) + 1;
                let span = total - self.warmup_steps;
                self.base_lr * (remaining.min(span) as f64) / span as f64
            }
            _ => self.base_lr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let schedule = LrSchedule::constant(1e-3);
        assert_eq!(schedule.lr_at(1), 1e-3);
        assert_eq!(schedule.lr_at(1000), 1e-3);
    }

    #[test]
    fn test_warmup_then_decay() {
        let schedule = LrSchedule::new(1.0, 4, Some(12));
        assert_eq!(schedule.lr_at(1), 0.25);
        assert_eq!(schedule.lr_at(4), 1.0);
        assert_eq!(schedule.lr_at(5), 1.0);
        assert_eq!(schedule.lr_at(12), 1.0 / 8.0);
        assert!(schedule.lr_at(20) > 0.0);
    }

    #[test]
    fn test_warmup_without_total() {
        let schedule = LrSchedule::new(2.0, 2, None);
        assert_eq!(schedule.lr_at(1), 1.0);
        assert_eq!(schedule.lr_at(50), 2.0);
    }
}
