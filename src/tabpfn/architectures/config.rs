//  Copyright (c) Prior Labs GmbH 2025.

use serde::{Deserialize, Serialize};

/// Configuration for the reference prior-fitting transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Feature width of every input batch (after padding).
    pub num_features: usize,

    /// Output channels: classes for classification, 2 for Gaussian NLL, 1 otherwise.
    pub n_out: usize,

    /// The embedding dimension
    #[serde(default = "default_emsize")]
    pub emsize: usize,

    /// Number of attention heads for query-to-context attention
    #[serde(default = "default_nhead")]
    pub nhead: usize,

    #[serde(default)]
    pub dropout: f64,

    /// Rows of the tuned prompt. Zero disables prompt tuning.
    #[serde(default)]
    pub prefix_size: usize,
}

// Default value functions
fn default_emsize() -> usize { 64 }
fn default_nhead() -> usize { 4 }

impl ModelConfig {
    pub fn new(num_features: usize, n_out: usize) -> Self {
        Self {
            num_features,
            n_out,
            emsize: default_emsize(),
            nhead: default_nhead(),
            dropout: 0.0,
            prefix_size: 0,
        }
    }

    pub fn with_prefix_size(mut self, prefix_size: usize) -> Self {
        self.prefix_size = prefix_size;
        self
    }

    pub fn with_emsize(mut self, emsize: usize, nhead: usize) -> Self {
        self.emsize = emsize;
        self.nhead = nhead;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"num_features": 100, "n_out": 10}"#).unwrap();
        assert_eq!(config.emsize, 64);
        assert_eq!(config.nhead, 4);
        assert_eq!(config.prefix_size, 0);
        assert_eq!(config, ModelConfig::new(100, 10));
    }
}
