//! Data-parallel context.
//!
//! Each process trains its own replica. Gradients are synchronised only at
//! accumulation boundaries; intermediate micro-batches never communicate.
//! Only rank 0 logs, runs checkpoint callbacks and returns a result.

use crate::tabpfn::settings::Settings;
use burn::optim::GradientsParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl DistributedContext {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            rank: settings.distributed.rank,
            world_size: settings.distributed.world_size.max(1),
        }
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// Cross-process gradient reduction, invoked once per accumulation window.
pub trait GradientSync {
    fn all_reduce(&self, grads: GradientsParams) -> GradientsParams;
}

/// Single-process sync: gradients pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGradientSync;

impl GradientSync for LocalGradientSync {
    fn all_reduce(&self, grads: GradientsParams) -> GradientsParams {
        grads
    }
}
