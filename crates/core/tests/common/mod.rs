//! Shared fixtures: a tiny MoE/QK-norm model config and a synthetic
//! checkpoint carrying every canonical external key in HF naming.
#![allow(dead_code)]

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use pipelm_core::config::ModelConfig;
use pipelm_core::loader::MapWeightLoader;

pub fn tiny_config() -> ModelConfig {
    let json = r#"{
        "model_id": "tiny-moe",
        "dtype": "fp32",
        "vocab_size": 32,
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "intermediate_size": 32,
        "rope_theta": 10000,
        "rms_norm_eps": 1e-6,
        "use_qk_norm": true,
        "use_moe": true,
        "num_experts": 2,
        "num_experts_per_tok": 1,
        "moe_intermediate_size": 32,
        "max_batch": 1,
        "max_seq_len": 8,
        "layer_end": 2
    }"#;
    serde_json::from_str(json).unwrap()
}

fn randn(dims: &[usize], device: &Device) -> Tensor {
    // Small scale keeps the tiny forward numerically tame in f32.
    Tensor::randn(0f32, 0.2, dims, device).unwrap()
}

/// Every canonical external key for `tiny_config`, with fused MoE experts.
pub fn build_checkpoint(cfg: &ModelConfig) -> MapWeightLoader {
    let device = Device::Cpu;
    let d = cfg.hidden_size;
    let hd = cfg.head_dim();
    let kv_out = cfg.num_kv_heads() * hd;
    let i_e = cfg.moe_intermediate_or_default();
    let e = cfg.num_experts;

    let mut tensors = HashMap::new();
    tensors.insert(
        "model.language_model.embed_tokens.weight".to_string(),
        randn(&[cfg.vocab_size, d], &device),
    );
    for layer in 0..cfg.num_hidden_layers {
        let base = format!("model.language_model.layers.{layer}");
        tensors.insert(format!("{base}.input_layernorm.weight"), randn(&[d], &device));
        tensors.insert(
            format!("{base}.post_attention_layernorm.weight"),
            randn(&[d], &device),
        );
        tensors.insert(format!("{base}.self_attn.q_proj.weight"), randn(&[d, d], &device));
        tensors.insert(
            format!("{base}.self_attn.k_proj.weight"),
            randn(&[kv_out, d], &device),
        );
        tensors.insert(
            format!("{base}.self_attn.v_proj.weight"),
            randn(&[kv_out, d], &device),
        );
        tensors.insert(format!("{base}.self_attn.o_proj.weight"), randn(&[d, d], &device));
        tensors.insert(format!("{base}.self_attn.q_norm.weight"), randn(&[hd], &device));
        tensors.insert(format!("{base}.self_attn.k_norm.weight"), randn(&[hd], &device));
        tensors.insert(format!("{base}.mlp.gate.weight"), randn(&[e, d], &device));
        tensors.insert(
            format!("{base}.mlp.experts.gate_up_proj"),
            randn(&[e, 2 * i_e, d], &device),
        );
        tensors.insert(
            format!("{base}.mlp.experts.down_proj"),
            randn(&[e, d, i_e], &device),
        );
    }
    tensors.insert(
        "model.language_model.norm.weight".to_string(),
        randn(&[d], &device),
    );
    tensors.insert("lm_head.weight".to_string(), randn(&[cfg.vocab_size, d], &device));

    MapWeightLoader::from_tensors(tensors)
}

pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32, what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: length mismatch");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol,
            "{what}: element {i} differs: {x} vs {y}"
        );
    }
}
