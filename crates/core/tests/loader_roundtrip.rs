//! Weight loader round-trip properties on a synthetic checkpoint.

mod common;

use candle_core::Device;
use common::{assert_close, build_checkpoint, tiny_config, to_vec};
use pipelm_core::loader::{
    diff_unused_keys, resolve_stage_weights, LoadOptions, WeightLoader,
};

#[test]
fn every_canonical_key_loads_and_matches_its_source() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let (tensors, report) =
        resolve_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();

    assert_eq!(report.missing, 0, "missing: {:?}", report.missing_keys);
    assert_eq!(report.mismatched, 0, "mismatched: {:?}", report.mismatch_keys);
    assert!(report.loaded > 0);
    assert!(diff_unused_keys(&wl, &report.used_keys).is_empty());

    // Directly mapped slots equal their source tensors.
    let direct = [
        (
            "embed_tokens.weight",
            "model.language_model.embed_tokens.weight",
        ),
        (
            "layers.0.input_layernorm.weight",
            "model.language_model.layers.0.input_layernorm.weight",
        ),
        (
            "layers.1.self_attn.q_proj.weight",
            "model.language_model.layers.1.self_attn.q_proj.weight",
        ),
        (
            "layers.0.self_attn.k_norm.weight",
            "model.language_model.layers.0.self_attn.k_norm.weight",
        ),
        (
            "layers.1.mlp.gate.weight",
            "model.language_model.layers.1.mlp.gate.weight",
        ),
        ("norm.weight", "model.language_model.norm.weight"),
        ("lm_head.weight", "lm_head.weight"),
    ];
    for (slot, key) in direct {
        let got = to_vec(&tensors[slot]);
        let want = to_vec(&wl.get(key).unwrap());
        assert_close(&got, &want, 0.0, slot);
    }
}

#[test]
fn fused_expert_tensors_split_into_gate_and_up_halves() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let i_e = cfg.moe_intermediate_or_default();
    let (tensors, _) =
        resolve_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();

    let gate_up = wl
        .get("model.language_model.layers.0.mlp.experts.gate_up_proj")
        .unwrap();
    let down = wl
        .get("model.language_model.layers.0.mlp.experts.down_proj")
        .unwrap();

    for e in 0..cfg.num_experts {
        let per_expert = gate_up.narrow(0, e, 1).unwrap().squeeze(0).unwrap();
        let want_gate = per_expert.narrow(0, 0, i_e).unwrap();
        let want_up = per_expert.narrow(0, i_e, i_e).unwrap();

        let got_gate = &tensors[&format!("layers.0.mlp.experts.{e}.gate_proj.weight")];
        let got_up = &tensors[&format!("layers.0.mlp.experts.{e}.up_proj.weight")];
        assert_close(
            &to_vec(got_gate),
            &to_vec(&want_gate),
            0.0,
            &format!("expert {e} gate"),
        );
        assert_close(
            &to_vec(got_up),
            &to_vec(&want_up),
            0.0,
            &format!("expert {e} up"),
        );

        let want_down = down.narrow(0, e, 1).unwrap().squeeze(0).unwrap();
        let got_down = &tensors[&format!("layers.0.mlp.experts.{e}.down_proj.weight")];
        assert_close(
            &to_vec(got_down),
            &to_vec(&want_down),
            0.0,
            &format!("expert {e} down"),
        );
    }
}

#[test]
fn middle_stage_resolves_only_its_layer_range() {
    let mut cfg = tiny_config();
    cfg.stage_id = 1;
    cfg.stage_count = 3;
    cfg.layer_start = 1;
    cfg.layer_end = 2;

    let wl = build_checkpoint(&cfg);
    let (tensors, report) =
        resolve_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
    assert_eq!(report.missing, 0);

    // The single local block maps from global layer 1.
    assert!(tensors.contains_key("layers.0.self_attn.q_proj.weight"));
    assert!(!tensors.contains_key("layers.1.self_attn.q_proj.weight"));
    assert!(!tensors.contains_key("embed_tokens.weight"));
    assert!(!tensors.contains_key("lm_head.weight"));

    let got = to_vec(&tensors["layers.0.self_attn.q_proj.weight"]);
    let want = to_vec(
        &wl.get("model.language_model.layers.1.self_attn.q_proj.weight")
            .unwrap(),
    );
    assert_close(&got, &want, 0.0, "global layer 1 -> local slot 0");

    // Unused keys are exactly the other layers' and the head/embed keys.
    let unused = diff_unused_keys(&wl, &report.used_keys);
    assert!(unused.iter().any(|k| k.contains("layers.0.")));
    assert!(unused.iter().any(|k| k == "lm_head.weight"));
}

#[test]
fn dtype_conversion_applies_on_assignment() {
    let mut cfg = tiny_config();
    cfg.dtype = "fp16".to_string();
    let wl = build_checkpoint(&cfg); // f32 source tensors
    let (tensors, report) =
        resolve_stage_weights(&cfg, &wl, &Device::Cpu, &LoadOptions::default()).unwrap();
    assert_eq!(report.mismatched, 0);
    assert_eq!(
        tensors["lm_head.weight"].dtype(),
        candle_core::DType::F16,
        "destination dtype wins"
    );
}
