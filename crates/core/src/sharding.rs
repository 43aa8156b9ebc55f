//! Layer sharding planner.
//!
//! Decides which contiguous run of transformer blocks lives on which stage
//! and sizes the per-stage resources. Estimates are planning aids, not
//! ground truth; the loader and cache report actual allocations.

use serde::Serialize;

use crate::config::{ConfigError, ModelConfig};

/// One stage's slice of the model plus resource estimates.
#[derive(Debug, Clone, Serialize)]
pub struct ShardSpec {
    pub stage_id: usize,
    pub stage_count: usize,
    pub layer_start: usize,
    pub layer_end: usize,
    pub device_index: usize,
    pub est_weight_bytes: usize,
    pub est_kv_bytes_per_token: usize,
}

/// Ordered stage specs covering `[0, num_hidden_layers)` without gaps.
#[derive(Debug, Clone, Serialize)]
pub struct ShardingPlan {
    pub stages: Vec<ShardSpec>,
}

/// Split `num_layers` into `stage_count` contiguous ranges.
///
/// Sizes differ by at most one; the first `num_layers % stage_count` ranges
/// take the larger size. Always returns exactly `stage_count` ranges whose
/// concatenation is `[0, num_layers)`.
pub fn shard_layers_even(num_layers: usize, stage_count: usize) -> Vec<(usize, usize)> {
    assert!(stage_count > 0, "stage_count must be > 0");
    let base = num_layers / stage_count;
    let extra = num_layers % stage_count;

    let mut ranges = Vec::with_capacity(stage_count);
    let mut cursor = 0;
    for s in 0..stage_count {
        let take = base + usize::from(s < extra);
        ranges.push((cursor, cursor + take));
        cursor += take;
    }
    debug_assert_eq!(cursor, num_layers);
    ranges
}

fn normalize_devices(
    stage_count: usize,
    device_indices: &[usize],
) -> Result<Vec<usize>, ConfigError> {
    match device_indices.len() {
        0 => Ok(vec![0; stage_count]),
        1 => Ok(vec![device_indices[0]; stage_count]),
        n if n == stage_count => Ok(device_indices.to_vec()),
        n => Err(ConfigError::DeviceListLength {
            got: n,
            expected: stage_count,
        }),
    }
}

fn build_plan(
    cfg: &ModelConfig,
    ranges: &[(usize, usize)],
    device_indices: &[usize],
) -> Result<ShardingPlan, ConfigError> {
    let stage_count = ranges.len();
    let devices = normalize_devices(stage_count, device_indices)?;

    let stages = ranges
        .iter()
        .zip(devices.iter())
        .enumerate()
        .map(|(s, (&(start, end), &device_index))| ShardSpec {
            stage_id: s,
            stage_count,
            layer_start: start,
            layer_end: end,
            device_index,
            est_weight_bytes: estimate_weight_bytes(cfg, start, end),
            est_kv_bytes_per_token: estimate_kv_bytes_per_token(cfg, start, end),
        })
        .collect();

    Ok(ShardingPlan { stages })
}

/// Even split plus device assignment.
///
/// `device_indices` may be empty (all zero), a single index (replicated), or
/// one per stage; any other length is a configuration error.
pub fn make_plan_even_layers(
    cfg: &ModelConfig,
    stage_count: usize,
    device_indices: &[usize],
) -> Result<ShardingPlan, ConfigError> {
    let ranges = shard_layers_even(cfg.num_hidden_layers, stage_count);
    build_plan(cfg, &ranges, device_indices)
}

/// Manual ranges; verified for contiguity, bounds and full coverage.
pub fn make_plan_manual(
    cfg: &ModelConfig,
    ranges: &[(usize, usize)],
    device_indices: &[usize],
) -> Result<ShardingPlan, ConfigError> {
    if ranges.is_empty() {
        return Err(ConfigError::InvalidRanges {
            num_layers: cfg.num_hidden_layers,
            detail: "no ranges given".to_string(),
        });
    }
    let mut cursor = 0;
    for &(start, end) in ranges {
        if start != cursor || end < start || end > cfg.num_hidden_layers {
            return Err(ConfigError::InvalidRanges {
                num_layers: cfg.num_hidden_layers,
                detail: format!("range ({start}, {end}) breaks contiguity at {cursor}"),
            });
        }
        cursor = end;
    }
    if cursor != cfg.num_hidden_layers {
        return Err(ConfigError::InvalidRanges {
            num_layers: cfg.num_hidden_layers,
            detail: format!("ranges end at {cursor}"),
        });
    }
    build_plan(cfg, ranges, device_indices)
}

/// A copy of the base config with the stage fields filled in from a spec.
pub fn config_for_stage(cfg: &ModelConfig, spec: &ShardSpec) -> ModelConfig {
    let mut out = cfg.clone();
    out.stage_id = spec.stage_id;
    out.stage_count = spec.stage_count;
    out.layer_start = spec.layer_start;
    out.layer_end = spec.layer_end;
    out.device_index = spec.device_index;
    out
}

/// KV bytes appended per token position across this stage's layers:
/// `n_layers * max_batch * kv_heads * head_dim * 2 * sizeof(dtype)`.
pub fn estimate_kv_bytes_per_token(
    cfg: &ModelConfig,
    layer_start: usize,
    layer_end: usize,
) -> usize {
    let n_layers = layer_end.saturating_sub(layer_start);
    n_layers
        * cfg.max_batch
        * cfg.num_kv_heads()
        * cfg.head_dim()
        * 2
        * cfg.dtype_size_bytes()
}

/// Rough parameter bytes for this stage's layer range.
///
/// Dense layer: `4*D^2 + 3*D*I + 2*D` parameters. MoE layer:
/// `4*D^2 + 2*D + D*E + E*3*D*I_e`. Stage 0 additionally carries
/// `2*V*D + D` to approximate embedding, LM head and final norm.
pub fn estimate_weight_bytes(cfg: &ModelConfig, layer_start: usize, layer_end: usize) -> usize {
    let n_layers = layer_end.saturating_sub(layer_start);
    let d = cfg.hidden_size;

    let per_layer = if cfg.use_moe {
        let e = cfg.num_experts;
        let i_e = cfg.moe_intermediate_or_default();
        4 * d * d + 2 * d + d * e + e * 3 * d * i_e
    } else {
        4 * d * d + 3 * d * cfg.intermediate_size + 2 * d
    };

    let shared = if layer_start == 0 && cfg.vocab_size > 0 {
        2 * cfg.vocab_size * d + d
    } else {
        0
    };

    (n_layers * per_layer + shared) * cfg.dtype_size_bytes()
}
