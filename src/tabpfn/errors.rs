//  Copyright (c) Prior Labs GmbH 2025.

//! Error taxonomy shared by data preparation and training.
//!
//! Structural failures (`Validation`, `State`, `MissingFile`, `AlreadyExists`,
//! `Configuration`, `Precondition`) abort the run. `Optimization` is only ever
//! produced inside the step loop, where it is logged and counted.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TabPfnError>;

#[derive(Debug, Error)]
pub enum TabPfnError {
    /// Malformed dataset, shape or value range.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("state error: {0}")]
    State(String),

    /// A required bundle artifact is absent.
    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),

    /// Refusing to overwrite an existing bundle.
    #[error("path already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Non-finite gradients or a failed optimizer step.
    #[error("optimization error: {0}")]
    Optimization(String),

    /// Unrecognized policy or strategy name.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A caller-side precondition on tensor shapes was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("record error: {0}")]
    Record(String),
}

impl TabPfnError {
    pub fn validation(message: impl Into<String>) -> Self {
        TabPfnError::Validation(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        TabPfnError::State(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        TabPfnError::Configuration(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        TabPfnError::Precondition(message.into())
    }

    pub fn optimization(message: impl Into<String>) -> Self {
        TabPfnError::Optimization(message.into())
    }

    /// Whether the step loop may absorb this error and keep training.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TabPfnError::Optimization(_))
    }
}

impl From<burn::record::RecorderError> for TabPfnError {
    fn from(err: burn::record::RecorderError) -> Self {
        TabPfnError::Record(format!("{:?}", err))
    }
}
