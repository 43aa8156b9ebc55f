pub mod error;
pub mod providers;
pub mod stage_map;

pub use error::LoadError;
pub use providers::{diff_unused_keys, MapWeightLoader, SafetensorsWeightLoader, WeightLoader};
pub use stage_map::{detect_qk_norm, resolve_stage_weights, LoadOptions, LoadReport};

use candle_core::Device;
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::ModelConfig;
use crate::model::ModelStage;

/// Resolve the archive into this stage's parameter slots and build the
/// stage from them.
///
/// QK-norm is enabled when the config requests it or when the archive
/// carries per-head norm weights for a local layer; the returned stage
/// reflects the effective setting.
pub fn load_stage_weights(
    cfg: &ModelConfig,
    wl: &dyn WeightLoader,
    device: &Device,
    opts: &LoadOptions,
) -> Result<(ModelStage, LoadReport), LoadError> {
    let mut effective = cfg.clone();
    if detect_qk_norm(cfg, wl) {
        effective.use_qk_norm = true;
    }

    let (tensors, report) = resolve_stage_weights(&effective, wl, device, opts)?;
    let dtype = effective.activation_dtype()?;
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    let stage = ModelStage::new(&effective, vb)?;

    info!(
        stage = effective.stage_id,
        layer_start = effective.layer_start,
        layer_end = effective.layer_end,
        qk_norm = effective.use_qk_norm,
        "{}",
        report.summary()
    );
    Ok((stage, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    fn dense_config() -> ModelConfig {
        let json = r#"{
            "vocab_size": 8,
            "hidden_size": 4,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "intermediate_size": 6,
            "max_batch": 1,
            "max_seq_len": 4,
            "dtype": "fp32",
            "layer_end": 1
        }"#;
        serde_json::from_str(json).unwrap()
    }

    fn randn(dims: &[usize]) -> Tensor {
        Tensor::randn(0f32, 1.0, dims, &Device::Cpu).unwrap()
    }

    fn dense_checkpoint(cfg: &ModelConfig) -> MapWeightLoader {
        let d = cfg.hidden_size;
        let kv = cfg.num_kv_heads() * cfg.head_dim();
        let i = cfg.intermediate_size;
        let mut wl = MapWeightLoader::new();
        wl.insert(
            "model.language_model.embed_tokens.weight",
            randn(&[cfg.vocab_size, d]),
        );
        let base = "model.language_model.layers.0";
        wl.insert(format!("{base}.input_layernorm.weight"), randn(&[d]));
        wl.insert(
            format!("{base}.post_attention_layernorm.weight"),
            randn(&[d]),
        );
        wl.insert(format!("{base}.self_attn.q_proj.weight"), randn(&[d, d]));
        wl.insert(format!("{base}.self_attn.k_proj.weight"), randn(&[kv, d]));
        wl.insert(format!("{base}.self_attn.v_proj.weight"), randn(&[kv, d]));
        wl.insert(format!("{base}.self_attn.o_proj.weight"), randn(&[d, d]));
        wl.insert(format!("{base}.mlp.gate_proj.weight"), randn(&[i, d]));
        wl.insert(format!("{base}.mlp.up_proj.weight"), randn(&[i, d]));
        wl.insert(format!("{base}.mlp.down_proj.weight"), randn(&[d, i]));
        wl.insert("model.language_model.norm.weight", randn(&[d]));
        wl.insert("lm_head.weight", randn(&[cfg.vocab_size, d]));
        wl
    }

    #[test]
    fn dense_checkpoint_loads_cleanly() {
        let cfg = dense_config();
        let wl = dense_checkpoint(&cfg);
        let (stage, report) =
            load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
        assert_eq!(report.missing, 0);
        assert_eq!(report.mismatched, 0);
        assert!(report.loaded >= 12);
        assert_eq!(stage.block_count(), 1);
        assert!(diff_unused_keys(&wl, &report.used_keys).is_empty());
    }

    #[test]
    fn lm_head_falls_back_to_prefixed_key() {
        let cfg = dense_config();
        let d = cfg.hidden_size;
        let mut wl = dense_checkpoint(&cfg);
        // Replace the bare key with the language-model-prefixed variant.
        let mut tensors = HashMap::new();
        for key in wl.list_keys() {
            if key != "lm_head.weight" {
                tensors.insert(key.clone(), wl.get(&key).unwrap());
            }
        }
        tensors.insert(
            "model.language_model.lm_head.weight".to_string(),
            randn(&[cfg.vocab_size, d]),
        );
        wl = MapWeightLoader::from_tensors(tensors);

        let (_stage, report) =
            load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
        assert_eq!(report.missing, 0);
        assert!(report
            .used_keys
            .iter()
            .any(|k| k == "model.language_model.lm_head.weight"));
    }

    #[test]
    fn strict_mode_fails_on_missing_required_key() {
        let cfg = dense_config();
        let mut tensors = HashMap::new();
        let wl_full = dense_checkpoint(&cfg);
        for key in wl_full.list_keys() {
            if !key.ends_with("q_proj.weight") {
                tensors.insert(key.clone(), wl_full.get(&key).unwrap());
            }
        }
        let wl = MapWeightLoader::from_tensors(tensors);
        let err = load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default());
        assert!(matches!(err, Err(LoadError::MissingKey(_))));
    }

    #[test]
    fn non_strict_mode_counts_and_continues() {
        let cfg = dense_config();
        let mut tensors = HashMap::new();
        let wl_full = dense_checkpoint(&cfg);
        for key in wl_full.list_keys() {
            if !key.ends_with("q_proj.weight") {
                tensors.insert(key.clone(), wl_full.get(&key).unwrap());
            }
        }
        let wl = MapWeightLoader::from_tensors(tensors);
        let opts = LoadOptions {
            strict: false,
            ..Default::default()
        };
        let (_stage, report) = load_stage_weights(&cfg, &wl, &Device::Cpu, &opts).unwrap();
        assert_eq!(report.missing, 1);
        assert!(report.missing_keys[0].contains("q_proj"));
    }

    #[test]
    fn transposed_2d_weights_are_fitted() {
        let cfg = dense_config();
        let d = cfg.hidden_size;
        let mut wl = dense_checkpoint(&cfg);
        let transposed = randn(&[d, cfg.vocab_size]);
        wl.insert("lm_head.weight", transposed.clone());

        let (tensors, report) = resolve_stage_weights(
            &cfg,
            &wl,
            &Device::Cpu,
            &LoadOptions::default(),
        )
        .unwrap();
        assert_eq!(report.mismatched, 0);
        let fitted = &tensors["lm_head.weight"];
        assert_eq!(fitted.dims(), &[cfg.vocab_size, d]);
        let want: Vec<f32> = transposed
            .t()
            .unwrap()
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let got: Vec<f32> = fitted.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(want, got);
    }

    #[test]
    fn shape_mismatch_is_fatal_in_strict_mode() {
        let cfg = dense_config();
        let mut wl = dense_checkpoint(&cfg);
        wl.insert("model.language_model.norm.weight", randn(&[7]));
        let err = load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default());
        assert!(matches!(err, Err(LoadError::ShapeMismatch { .. })));
    }

    #[test]
    fn qk_norm_is_enabled_by_archive_keys() {
        let cfg = dense_config();
        assert!(!cfg.use_qk_norm);
        let mut wl = dense_checkpoint(&cfg);
        let hd = cfg.head_dim();
        wl.insert(
            "model.language_model.layers.0.self_attn.q_norm.weight",
            randn(&[hd]),
        );
        wl.insert(
            "model.language_model.layers.0.self_attn.k_norm.weight",
            randn(&[hd]),
        );
        assert!(detect_qk_norm(&cfg, &wl));

        let (stage, report) =
            load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
        assert!(stage.config().use_qk_norm);
        assert!(report
            .used_keys
            .iter()
            .any(|k| k.ends_with("q_norm.weight")));
    }

    #[test]
    fn qk_norm_accepts_layernorm_key_variant() {
        let mut cfg = dense_config();
        cfg.use_qk_norm = true;
        let hd = cfg.head_dim();
        let mut wl = dense_checkpoint(&cfg);
        wl.insert(
            "model.language_model.layers.0.self_attn.q_layernorm.weight",
            randn(&[hd]),
        );
        wl.insert(
            "model.language_model.layers.0.self_attn.k_layernorm.weight",
            randn(&[hd]),
        );
        let (_stage, report) =
            load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
        assert_eq!(report.missing, 0);
    }

    #[test]
    fn plain_model_layers_prefix_is_accepted() {
        let cfg = dense_config();
        let wl_full = dense_checkpoint(&cfg);
        let mut tensors = HashMap::new();
        for key in wl_full.list_keys() {
            let renamed = key.replace("model.language_model.layers", "model.layers");
            tensors.insert(renamed, wl_full.get(&key).unwrap());
        }
        let wl = MapWeightLoader::from_tensors(tensors);
        let (_stage, report) =
            load_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
        assert_eq!(report.missing, 0);
        assert_eq!(report.mismatched, 0);
    }
}
