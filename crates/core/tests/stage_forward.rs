//! End-to-end stage forward scenarios on the tiny MoE model.

mod common;

use candle_core::{Device, Tensor};
use common::{assert_close, build_checkpoint, tiny_config, to_vec};
use pipelm_core::loader::{load_stage_weights, LoadOptions};
use pipelm_core::model::StageInput;

#[test]
fn tiny_forward_produces_hidden_and_logits() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let device = Device::Cpu;
    let (mut stage, report) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();
    assert_eq!(report.missing, 0);
    assert_eq!(report.mismatched, 0);

    let ids = Tensor::from_vec(vec![0u32, 1, 2, 3], (1, 4), &device).unwrap();
    let out = stage
        .forward(&StageInput {
            input_ids: Some(ids),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(out.hidden_out.dims(), &[1, 4, 16]);
    let logits = out.logits.expect("single stage produces logits");
    assert_eq!(logits.dims(), &[1, 4, 32]);
    assert!(
        to_vec(&logits).iter().all(|v| v.is_finite()),
        "logits must be finite"
    );
}

#[test]
fn kv_append_across_calls_matches_single_shot() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let device = Device::Cpu;

    // Incremental: [[5, 6]] at pos 0 then [[7]] at pos 2.
    let (mut incremental, _) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();
    let ids_a = Tensor::from_vec(vec![5u32, 6], (1, 2), &device).unwrap();
    incremental
        .forward(&StageInput {
            input_ids: Some(ids_a),
            ..Default::default()
        })
        .unwrap();
    let ids_b = Tensor::from_vec(vec![7u32], (1, 1), &device).unwrap();
    incremental
        .forward(&StageInput {
            input_ids: Some(ids_b),
            pos: 2,
            ..Default::default()
        })
        .unwrap();

    // Single shot: [[5, 6, 7]] at pos 0 on a fresh stage with the same weights.
    let (mut single, _) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();
    let ids = Tensor::from_vec(vec![5u32, 6, 7], (1, 3), &device).unwrap();
    single
        .forward(&StageInput {
            input_ids: Some(ids),
            ..Default::default()
        })
        .unwrap();

    for layer in 0..2 {
        let (k_inc, v_inc) = incremental.kv_cache().prefix(layer, 1, 3).unwrap();
        let (k_one, v_one) = single.kv_cache().prefix(layer, 1, 3).unwrap();
        assert_close(
            &to_vec(&k_inc),
            &to_vec(&k_one),
            1e-5,
            &format!("layer {layer} k prefix"),
        );
        assert_close(
            &to_vec(&v_inc),
            &to_vec(&v_one),
            1e-5,
            &format!("layer {layer} v prefix"),
        );
    }
}

#[test]
fn incremental_decode_matches_full_prefill_logits() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let device = Device::Cpu;

    let (mut incremental, _) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();
    let prompt = Tensor::from_vec(vec![3u32, 9, 14], (1, 3), &device).unwrap();
    incremental
        .forward(&StageInput {
            input_ids: Some(prompt),
            ..Default::default()
        })
        .unwrap();
    let next = Tensor::from_vec(vec![21u32], (1, 1), &device).unwrap();
    let decode = incremental
        .forward(&StageInput {
            input_ids: Some(next),
            pos: 3,
            ..Default::default()
        })
        .unwrap();
    let decode_logits = decode.logits.unwrap();
    assert_eq!(decode_logits.dims(), &[1, 1, 32]);

    let (mut full, _) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();
    let all_ids = Tensor::from_vec(vec![3u32, 9, 14, 21], (1, 4), &device).unwrap();
    let full_out = full
        .forward(&StageInput {
            input_ids: Some(all_ids),
            ..Default::default()
        })
        .unwrap();
    let last_logits = full_out.logits.unwrap().narrow(1, 3, 1).unwrap();

    assert_close(
        &to_vec(&decode_logits),
        &to_vec(&last_logits),
        1e-4,
        "decode step logits",
    );
}

#[test]
fn positions_beyond_max_seq_len_are_fatal() {
    let cfg = tiny_config();
    let wl = build_checkpoint(&cfg);
    let device = Device::Cpu;
    let (mut stage, _) =
        load_stage_weights(&cfg, &wl, &device, &LoadOptions::default()).unwrap();

    let ids = Tensor::from_vec(vec![1u32, 2], (1, 2), &device).unwrap();
    stage
        .forward(&StageInput {
            input_ids: Some(ids),
            pos: 0,
            ..Default::default()
        })
        .unwrap();
    let more = Tensor::from_vec(vec![1u32, 2], (1, 2), &device).unwrap();
    assert!(stage
        .forward(&StageInput {
            input_ids: Some(more),
            pos: 7,
            ..Default::default()
        })
        .is_err());
}
