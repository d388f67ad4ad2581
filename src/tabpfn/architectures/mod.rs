//! The model collaborator: what the training loop needs from a prior-fitting
//! network, plus a small reference transformer implementing it.

pub mod config;
pub mod model;

pub use config::ModelConfig;
pub use model::{PrefixEmbedding, PriorFittingModel, PriorTransformer};
