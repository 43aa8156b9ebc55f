pub mod attention;
pub mod mask;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use attention::{repeat_kv, Attention};
pub use mask::{apply_attention_mask, causal_mask};
pub use mlp::SwiGluMlp;
pub use normalization::{apply_per_head_norm, rms_norm, RmsNorm};
pub use rotary::{precompute_cos_sin, RopeTables};
