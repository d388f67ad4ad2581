//! Dynamic loss scaling for mixed-precision training.
//!
//! The loss is multiplied by the current scale before the backward pass.
//! At the accumulation boundary gradients are unscaled; an overflow skips
//! the optimizer step and backs the scale off, a run of clean steps grows it.

use super::grad::{global_norm, scale_gradients};
use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn new(init_scale: f32, growth_interval: usize) -> Self {
        Self {
            scale: init_scale,
            growth_interval: growth_interval.max(1),
            ..Self::default()
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss * self.scale
    }

    /// Divide gradients by the scale. Returns `false` when they overflowed.
    pub fn unscale<B, M>(&self, module: &M, grads: &mut GradientsParams) -> bool
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        scale_gradients(module, grads, 1.0 / self.scale);
        global_norm(module, grads).is_finite()
    }

    /// Adjust the scale after a boundary step.
    pub fn update(&mut self, found_overflow: bool) {
        if found_overflow {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            log::debug!("loss scale backed off to {}", self.scale);
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
        }
    }
}
