//! Model and stage configuration.
//!
//! One [`ModelConfig`] describes the full model plus the slice of it owned by
//! the current pipeline stage (`stage_id`, `layer_start..layer_end`,
//! `device_index`). The sharding planner produces per-stage copies via
//! [`crate::sharding::config_for_stage`].

use std::path::Path;

use candle_core::DType;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported dtype '{0}' (expected fp16, bf16 or fp32)")]
    UnsupportedDtype(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error(
        "invalid layer range: layer_start {start} layer_end {end} with {num_layers} total layers"
    )]
    InvalidLayerRange {
        start: usize,
        end: usize,
        num_layers: usize,
    },

    #[error("hidden_size {hidden} must be divisible by num_attention_heads {heads}")]
    HiddenNotDivisible { hidden: usize, heads: usize },

    #[error("num_key_value_heads {kv} must not exceed num_attention_heads {q}")]
    KvHeadsExceedHeads { kv: usize, q: usize },

    #[error("num_attention_heads {q} must be divisible by num_key_value_heads {kv}")]
    KvHeadsNotDivisor { q: usize, kv: usize },

    #[error("rope_dim {0} must be even")]
    OddRopeDim(usize),

    #[error("rope_dim {rope_dim} must not exceed head_dim {head_dim}")]
    RopeDimTooLarge { rope_dim: usize, head_dim: usize },

    #[error("device_indices must be empty, length 1, or length {expected}; got {got}")]
    DeviceListLength { got: usize, expected: usize },

    #[error("sharding ranges must be contiguous from 0 to {num_layers}; {detail}")]
    InvalidRanges { num_layers: usize, detail: String },
}

fn default_dtype() -> String {
    "bf16".to_string()
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_batch() -> usize {
    1
}

fn default_max_seq_len() -> usize {
    4096
}

fn default_vision_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

fn one() -> usize {
    1
}

/// Immutable per-run configuration, deserialized from an HF-style JSON file.
///
/// Fields absent from the JSON fall back to defaults; stage geometry fields
/// are normally filled in by the planner or the CLI rather than the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_id: String,

    /// Activation dtype: "fp16", "bf16" (default) or "fp32" for CPU parity runs.
    #[serde(default = "default_dtype")]
    pub dtype: String,

    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,

    /// 0 means "same as num_attention_heads" (no GQA).
    #[serde(default)]
    pub num_key_value_heads: usize,

    pub intermediate_size: usize,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Rotary dimension. 0 means "use head_dim".
    #[serde(default)]
    pub rope_dim: usize,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    #[serde(default)]
    pub use_qk_norm: bool,

    #[serde(default)]
    pub use_moe: bool,

    #[serde(default)]
    pub num_experts: usize,

    #[serde(default)]
    pub num_experts_per_tok: usize,

    #[serde(default)]
    pub moe_intermediate_size: usize,

    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    // Vision tower. vision_hidden_size == 0 means "text only".
    #[serde(default)]
    pub vision_hidden_size: usize,
    #[serde(default)]
    pub vision_intermediate_size: usize,
    #[serde(default)]
    pub vision_num_heads: usize,
    #[serde(default)]
    pub vision_num_layers: usize,
    #[serde(default)]
    pub vision_patch_size: usize,
    #[serde(default = "default_vision_channels")]
    pub vision_num_channels: usize,
    /// Capacity of the learned position table (patch tokens, CLS excluded).
    #[serde(default)]
    pub vision_max_patches: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub vision_layer_norm_eps: f64,
    /// Projector middle width. 0 means "use hidden_size".
    #[serde(default)]
    pub projector_hidden_size: usize,

    // Stage geometry.
    #[serde(default)]
    pub stage_id: usize,
    #[serde(default = "one")]
    pub stage_count: usize,
    #[serde(default)]
    pub layer_start: usize,
    /// Exclusive. 0 in the JSON means "num_hidden_layers".
    #[serde(default)]
    pub layer_end: usize,
    #[serde(default)]
    pub device_index: usize,
}

impl ModelConfig {
    /// Read a config from an HF-style JSON file and normalize stage defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut cfg: ModelConfig = serde_json::from_str(&content)?;
        if cfg.layer_end == 0 {
            cfg.layer_end = cfg.num_hidden_layers;
        }
        Ok(cfg)
    }

    pub fn activation_dtype(&self) -> Result<DType, ConfigError> {
        match self.dtype.as_str() {
            "bf16" => Ok(DType::BF16),
            "fp16" | "f16" => Ok(DType::F16),
            "fp32" | "f32" => Ok(DType::F32),
            other => Err(ConfigError::UnsupportedDtype(other.to_string())),
        }
    }

    /// Element size of the activation dtype, used by the planner's estimators.
    pub fn dtype_size_bytes(&self) -> usize {
        match self.dtype.as_str() {
            "fp32" | "f32" => 4,
            _ => 2,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        if self.num_key_value_heads > 0 {
            self.num_key_value_heads
        } else {
            self.num_attention_heads
        }
    }

    pub fn rope_dim_or_default(&self) -> usize {
        if self.rope_dim > 0 {
            self.rope_dim
        } else {
            self.head_dim()
        }
    }

    pub fn moe_intermediate_or_default(&self) -> usize {
        if self.moe_intermediate_size > 0 {
            self.moe_intermediate_size
        } else {
            self.intermediate_size
        }
    }

    pub fn projector_hidden_or_default(&self) -> usize {
        if self.projector_hidden_size > 0 {
            self.projector_hidden_size
        } else {
            self.hidden_size
        }
    }

    pub fn has_vision(&self) -> bool {
        self.vision_hidden_size > 0
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage_id == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_id + 1 == self.stage_count
    }

    /// Number of transformer blocks owned by this stage.
    pub fn block_count(&self) -> usize {
        self.layer_end.saturating_sub(self.layer_start)
    }

    /// Check every structural invariant the forward path relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden_size == 0 {
            return Err(ConfigError::MissingField("hidden_size"));
        }
        if self.num_attention_heads == 0 {
            return Err(ConfigError::MissingField("num_attention_heads"));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConfigError::HiddenNotDivisible {
                hidden: self.hidden_size,
                heads: self.num_attention_heads,
            });
        }
        let kv = self.num_kv_heads();
        if kv > self.num_attention_heads {
            return Err(ConfigError::KvHeadsExceedHeads {
                kv,
                q: self.num_attention_heads,
            });
        }
        if self.num_attention_heads % kv != 0 {
            return Err(ConfigError::KvHeadsNotDivisor {
                q: self.num_attention_heads,
                kv,
            });
        }
        let rope_dim = self.rope_dim_or_default();
        if rope_dim % 2 != 0 {
            return Err(ConfigError::OddRopeDim(rope_dim));
        }
        if rope_dim > self.head_dim() {
            return Err(ConfigError::RopeDimTooLarge {
                rope_dim,
                head_dim: self.head_dim(),
            });
        }
        if self.layer_start > self.layer_end || self.layer_end > self.num_hidden_layers {
            return Err(ConfigError::InvalidLayerRange {
                start: self.layer_start,
                end: self.layer_end,
                num_layers: self.num_hidden_layers,
            });
        }
        if self.use_moe {
            if self.num_experts == 0 {
                return Err(ConfigError::MissingField("num_experts"));
            }
            if self.num_experts_per_tok == 0 {
                return Err(ConfigError::MissingField("num_experts_per_tok"));
            }
        }
        if self.max_batch == 0 {
            return Err(ConfigError::MissingField("max_batch"));
        }
        if self.max_seq_len == 0 {
            return Err(ConfigError::MissingField("max_seq_len"));
        }
        Ok(())
    }
}
