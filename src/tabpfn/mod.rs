pub mod architectures;
pub mod data;
pub mod errors;
pub mod settings;
pub mod train;
