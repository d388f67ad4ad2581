//! tabpfn-pt: data preparation, prompt tuning and ensembled training for
//! prior-fitted tabular transformers.

pub mod tabpfn;

pub use tabpfn::errors::{Result, TabPfnError};
pub use tabpfn::settings::{settings, Settings};

/// Test utilities for backend-aware tensor construction
pub mod test_utils;
