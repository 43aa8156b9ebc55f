use thiserror::Error;

use crate::config::ConfigError;
use crate::tensor_util::ShapeDtypeError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("required weight missing: {0}")]
    MissingKey(String),

    #[error("shape mismatch for {key}: expected {expected}, got {got}")]
    ShapeMismatch {
        key: String,
        expected: String,
        got: String,
    },

    #[error("fused expert tensor {key} has unsupported shape {got}")]
    FusedAxisMismatch { key: String, got: String },

    #[error("weight archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ShapeDtype(#[from] ShapeDtypeError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_key() {
        let e = LoadError::MissingKey("lm_head.weight".to_string());
        assert_eq!(e.to_string(), "required weight missing: lm_head.weight");

        let e = LoadError::ShapeMismatch {
            key: "model.norm.weight".to_string(),
            expected: "[16]".to_string(),
            got: "[32]".to_string(),
        };
        assert!(e.to_string().contains("model.norm.weight"));
        assert!(e.to_string().contains("[16]"));
    }
}
