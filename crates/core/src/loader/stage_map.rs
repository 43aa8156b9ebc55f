//! External-name to stage-slot weight mapping.
//!
//! The mapper walks the stage's canonical parameter slots in a fixed order,
//! probes the archive for each slot's candidate external keys, applies the
//! assignment policy (dtype/device conversion, transpose fit, fused expert
//! splitting) and produces the internal name -> tensor map the stage is
//! built from, together with a load report.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use super::error::LoadError;
use super::providers::WeightLoader;
use crate::config::ModelConfig;
use crate::tensor_util::{shape_str, to_device_dtype};
use crate::vision;

pub struct LoadOptions {
    /// Promote missing required keys and shape mismatches to hard errors.
    pub strict: bool,
    /// Map vision tower weights. Currently deferred: the tower is
    /// zero-initialized and the report records a skip.
    pub load_vision: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            strict: true,
            load_vision: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: usize,
    pub mismatched: usize,
    pub skipped: usize,
    pub missing_keys: Vec<String>,
    pub mismatch_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
    pub used_keys: Vec<String>,
}

impl LoadReport {
    pub fn summary(&self) -> String {
        format!(
            "loaded {} missing {} mismatched {} skipped {}",
            self.loaded, self.missing, self.mismatched, self.skipped
        )
    }
}

const LAYER_PREFIXES: [&str; 2] = ["model.language_model.layers", "model.layers"];

fn layer_candidates(layer: usize, suffix: &str) -> Vec<String> {
    LAYER_PREFIXES
        .iter()
        .map(|p| format!("{p}.{layer}.{suffix}"))
        .collect()
}

/// Whether the stage should be built with QK-norm: either the config says
/// so, or the archive carries per-head norm weights for a local layer.
pub fn detect_qk_norm(cfg: &ModelConfig, wl: &dyn WeightLoader) -> bool {
    if cfg.use_qk_norm {
        return true;
    }
    (cfg.layer_start..cfg.layer_end).any(|layer| {
        layer_candidates(layer, "self_attn.q_norm.weight")
            .into_iter()
            .chain(layer_candidates(layer, "self_attn.q_layernorm.weight"))
            .any(|k| wl.exists(&k))
    })
}

struct SlotResolver<'a> {
    wl: &'a dyn WeightLoader,
    dtype: DType,
    device: Device,
    strict: bool,
    report: LoadReport,
    out: HashMap<String, Tensor>,
}

impl SlotResolver<'_> {
    fn convert(&self, src: &Tensor) -> Result<Tensor, LoadError> {
        Ok(to_device_dtype(src, &self.device, self.dtype)?)
    }

    /// Direct copy if shapes match; transposed copy for fitting 2-D
    /// tensors; `None` otherwise.
    fn fit(&self, src: &Tensor, want: &[usize]) -> Result<Option<Tensor>, LoadError> {
        if src.dims() == want {
            return Ok(Some(src.clone()));
        }
        if src.rank() == 2 && want.len() == 2 && src.dims() == [want[1], want[0]] {
            return Ok(Some(src.t()?.contiguous()?));
        }
        Ok(None)
    }

    fn record_missing(&mut self, key: &str, required: bool) -> Result<(), LoadError> {
        if !required {
            return Ok(());
        }
        if self.strict {
            return Err(LoadError::MissingKey(key.to_string()));
        }
        self.report.missing += 1;
        self.report.missing_keys.push(key.to_string());
        Ok(())
    }

    fn record_mismatch(
        &mut self,
        key: &str,
        want: &[usize],
        got: &[usize],
    ) -> Result<(), LoadError> {
        if self.strict {
            return Err(LoadError::ShapeMismatch {
                key: key.to_string(),
                expected: shape_str(want),
                got: shape_str(got),
            });
        }
        self.report.mismatched += 1;
        self.report
            .mismatch_keys
            .push(format!("{key}: expected {}, got {}", shape_str(want), shape_str(got)));
        Ok(())
    }

    /// Non-strict loads fall back to zeros so the stage stays constructible.
    fn fill_zero(&mut self, slot: &str, want: &[usize]) -> Result<(), LoadError> {
        let zeros = Tensor::zeros(want, self.dtype, &self.device)?;
        self.out.insert(slot.to_string(), zeros);
        Ok(())
    }

    /// Assign one slot from the first candidate key that exists.
    fn assign(
        &mut self,
        slot: &str,
        candidates: &[String],
        want: &[usize],
        required: bool,
    ) -> Result<bool, LoadError> {
        let Some(key) = candidates.iter().find(|k| self.wl.exists(k)) else {
            self.record_missing(&candidates[0], required)?;
            if required {
                self.fill_zero(slot, want)?;
            }
            return Ok(false);
        };
        let src = self.wl.get(key)?;
        self.report.used_keys.push(key.clone());
        let src = self.convert(&src)?;
        match self.fit(&src, want)? {
            Some(t) => {
                self.out.insert(slot.to_string(), t);
                self.report.loaded += 1;
                Ok(true)
            }
            None => {
                self.record_mismatch(key, want, src.dims())?;
                self.fill_zero(slot, want)?;
                Ok(false)
            }
        }
    }

    /// Assign an already-fetched tensor (used for fused expert halves).
    fn assign_tensor(
        &mut self,
        slot: &str,
        key: &str,
        src: &Tensor,
        want: &[usize],
    ) -> Result<(), LoadError> {
        match self.fit(src, want)? {
            Some(t) => {
                self.out.insert(slot.to_string(), t.contiguous()?);
                self.report.loaded += 1;
                Ok(())
            }
            None => {
                self.record_mismatch(key, want, src.dims())?;
                self.fill_zero(slot, want)
            }
        }
    }

    fn assign_fused_experts(
        &mut self,
        cfg: &ModelConfig,
        layer: usize,
        slot_base: &str,
    ) -> Result<(), LoadError> {
        let num_experts = cfg.num_experts;
        let i_e = cfg.moe_intermediate_or_default();
        let d = cfg.hidden_size;

        let gate_up_candidates = layer_candidates(layer, "mlp.experts.gate_up_proj");
        let down_candidates = layer_candidates(layer, "mlp.experts.down_proj");
        let gate_up_key = gate_up_candidates.iter().find(|k| self.wl.exists(k)).cloned();
        let down_key = down_candidates.iter().find(|k| self.wl.exists(k)).cloned();

        let (Some(gate_up_key), Some(down_key)) = (gate_up_key, down_key) else {
            for (found, candidates) in [
                (gate_up_candidates.iter().any(|k| self.wl.exists(k)), &gate_up_candidates),
                (down_candidates.iter().any(|k| self.wl.exists(k)), &down_candidates),
            ] {
                if !found {
                    self.record_missing(&candidates[0], true)?;
                }
            }
            for e in 0..num_experts {
                self.fill_zero(&format!("{slot_base}.experts.{e}.gate_proj.weight"), &[i_e, d])?;
                self.fill_zero(&format!("{slot_base}.experts.{e}.up_proj.weight"), &[i_e, d])?;
                self.fill_zero(&format!("{slot_base}.experts.{e}.down_proj.weight"), &[d, i_e])?;
            }
            return Ok(());
        };

        let gate_up = self.convert(&self.wl.get(&gate_up_key)?)?;
        let down = self.convert(&self.wl.get(&down_key)?)?;
        self.report.used_keys.push(gate_up_key.clone());
        self.report.used_keys.push(down_key.clone());

        for e in 0..num_experts {
            let per_expert = self.expert_slice(&gate_up, e, num_experts, &gate_up_key)?;
            let gate_slot = format!("{slot_base}.experts.{e}.gate_proj.weight");
            let up_slot = format!("{slot_base}.experts.{e}.up_proj.weight");
            match split_gate_up(&per_expert, i_e)? {
                Some((gate, up)) => {
                    self.assign_tensor(&gate_slot, &gate_up_key, &gate, &[i_e, d])?;
                    self.assign_tensor(&up_slot, &gate_up_key, &up, &[i_e, d])?;
                }
                None => {
                    if self.strict {
                        return Err(LoadError::FusedAxisMismatch {
                            key: gate_up_key.clone(),
                            got: shape_str(per_expert.dims()),
                        });
                    }
                    self.record_mismatch(&gate_up_key, &[2 * i_e, d], per_expert.dims())?;
                    self.fill_zero(&gate_slot, &[i_e, d])?;
                    self.fill_zero(&up_slot, &[i_e, d])?;
                }
            }

            let down_e = self.expert_slice(&down, e, num_experts, &down_key)?;
            self.assign_tensor(
                &format!("{slot_base}.experts.{e}.down_proj.weight"),
                &down_key,
                &down_e,
                &[d, i_e],
            )?;
        }
        Ok(())
    }

    /// Element `e` of a batched `[E, ...]` expert tensor. A non-batched 2-D
    /// tensor is treated as identical for every expert (last resort).
    fn expert_slice(
        &self,
        t: &Tensor,
        e: usize,
        num_experts: usize,
        key: &str,
    ) -> Result<Tensor, LoadError> {
        if t.rank() == 3 && t.dims()[0] == num_experts {
            Ok(t.narrow(0, e, 1)?.squeeze(0)?)
        } else if t.rank() == 2 {
            if e == 0 {
                warn!(key, "expert tensor is not batched; replicating for all experts");
            }
            Ok(t.clone())
        } else {
            Err(LoadError::FusedAxisMismatch {
                key: key.to_string(),
                got: shape_str(t.dims()),
            })
        }
    }
}

/// Split a per-expert fused gate/up tensor along its `2*I_e` axis.
fn split_gate_up(t: &Tensor, i_e: usize) -> Result<Option<(Tensor, Tensor)>, LoadError> {
    if t.rank() != 2 {
        return Ok(None);
    }
    let dims = t.dims();
    if dims[0] == 2 * i_e {
        Ok(Some((t.narrow(0, 0, i_e)?, t.narrow(0, i_e, i_e)?)))
    } else if dims[1] == 2 * i_e {
        Ok(Some((t.narrow(1, 0, i_e)?, t.narrow(1, i_e, i_e)?)))
    } else {
        Ok(None)
    }
}

/// Resolve every canonical slot of the stage described by `cfg` into an
/// internal name -> tensor map ready for stage construction.
///
/// `cfg` must already carry the effective `use_qk_norm` (see
/// [`detect_qk_norm`]); [`super::load_stage_weights`] handles that.
pub fn resolve_stage_weights(
    cfg: &ModelConfig,
    wl: &dyn WeightLoader,
    device: &Device,
    opts: &LoadOptions,
) -> Result<(HashMap<String, Tensor>, LoadReport), LoadError> {
    cfg.validate()?;
    let dtype = cfg.activation_dtype()?;

    let mut r = SlotResolver {
        wl,
        dtype,
        device: device.clone(),
        strict: opts.strict,
        report: LoadReport::default(),
        out: HashMap::new(),
    };

    let d = cfg.hidden_size;
    let kv_out = cfg.num_kv_heads() * cfg.head_dim();
    let head_dim = cfg.head_dim();

    if cfg.is_first_stage() && cfg.vocab_size > 0 {
        r.assign(
            "embed_tokens.weight",
            &[
                "model.language_model.embed_tokens.weight".to_string(),
                "model.embed_tokens.weight".to_string(),
                "embed_tokens.weight".to_string(),
                "transformer.wte.weight".to_string(),
            ],
            &[cfg.vocab_size, d],
            true,
        )?;
    }

    for i in 0..cfg.block_count() {
        let layer = cfg.layer_start + i;
        let slot_base = format!("layers.{i}");

        r.assign(
            &format!("{slot_base}.input_layernorm.weight"),
            &layer_candidates(layer, "input_layernorm.weight"),
            &[d],
            true,
        )?;
        r.assign(
            &format!("{slot_base}.post_attention_layernorm.weight"),
            &layer_candidates(layer, "post_attention_layernorm.weight"),
            &[d],
            true,
        )?;

        r.assign(
            &format!("{slot_base}.self_attn.q_proj.weight"),
            &layer_candidates(layer, "self_attn.q_proj.weight"),
            &[d, d],
            true,
        )?;
        r.assign(
            &format!("{slot_base}.self_attn.k_proj.weight"),
            &layer_candidates(layer, "self_attn.k_proj.weight"),
            &[kv_out, d],
            true,
        )?;
        r.assign(
            &format!("{slot_base}.self_attn.v_proj.weight"),
            &layer_candidates(layer, "self_attn.v_proj.weight"),
            &[kv_out, d],
            true,
        )?;
        r.assign(
            &format!("{slot_base}.self_attn.o_proj.weight"),
            &layer_candidates(layer, "self_attn.o_proj.weight"),
            &[d, d],
            true,
        )?;

        if cfg.use_qk_norm {
            for role in ["q", "k"] {
                let mut candidates = layer_candidates(layer, &format!("self_attn.{role}_norm.weight"));
                candidates
                    .extend(layer_candidates(layer, &format!("self_attn.{role}_layernorm.weight")));
                r.assign(
                    &format!("{slot_base}.self_attn.{role}_norm.weight"),
                    &candidates,
                    &[head_dim],
                    true,
                )?;
            }
        }

        if cfg.use_moe {
            r.assign(
                &format!("{slot_base}.mlp.gate.weight"),
                &layer_candidates(layer, "mlp.gate.weight"),
                &[cfg.num_experts, d],
                true,
            )?;
            r.assign_fused_experts(cfg, layer, &format!("{slot_base}.mlp"))?;
        } else {
            let i_sz = cfg.intermediate_size;
            r.assign(
                &format!("{slot_base}.mlp.gate_proj.weight"),
                &layer_candidates(layer, "mlp.gate_proj.weight"),
                &[i_sz, d],
                true,
            )?;
            r.assign(
                &format!("{slot_base}.mlp.up_proj.weight"),
                &layer_candidates(layer, "mlp.up_proj.weight"),
                &[i_sz, d],
                true,
            )?;
            r.assign(
                &format!("{slot_base}.mlp.down_proj.weight"),
                &layer_candidates(layer, "mlp.down_proj.weight"),
                &[d, i_sz],
                true,
            )?;
        }
    }

    if cfg.is_last_stage() && cfg.vocab_size > 0 {
        r.assign(
            "norm.weight",
            &[
                "model.language_model.norm.weight".to_string(),
                "model.norm.weight".to_string(),
            ],
            &[d],
            true,
        )?;
        r.assign(
            "lm_head.weight",
            &[
                "lm_head.weight".to_string(),
                "model.language_model.lm_head.weight".to_string(),
                "model.lm_head.weight".to_string(),
            ],
            &[cfg.vocab_size, d],
            true,
        )?;
    }

    if cfg.has_vision() {
        // Vision checkpoint mapping is deferred; build the tower zero-filled
        // so the stage is runnable, and record the skip.
        for (name, dims) in vision::parameter_shapes(cfg) {
            let zeros = Tensor::zeros(dims.as_slice(), dtype, device)?;
            r.out.insert(name, zeros);
        }
        r.report.skipped += 1;
        r.report.skipped_keys.push("vision".to_string());
        if opts.load_vision {
            debug!("load_vision requested but vision mapping is deferred");
        }
    }

    debug!(
        stage = cfg.stage_id,
        layers = cfg.block_count(),
        "{}",
        r.report.summary()
    );
    Ok((r.out, r.report))
}
