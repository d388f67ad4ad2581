//! Cosine learning-rate schedule with linear warmup, stepped once per epoch.

use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct CosineWarmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl CosineWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
            step: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.base_lr * self.factor(self.step)
    }

    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.lr()
    }

    fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / span as f64;
        (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_decay() {
        let mut schedule = CosineWarmup::new(1.0, 2, 6);
        assert_eq!(schedule.lr(), 0.0);
        assert_eq!(schedule.step(), 0.5);
        assert_eq!(schedule.step(), 1.0);
        let mid = (schedule.step(), schedule.step());
        approx::assert_abs_diff_eq!(mid.1, 0.5, epsilon = 1e-12);
        assert!(mid.0 > mid.1);
        schedule.step();
        assert!(schedule.step() < 1e-12);
    }
}
