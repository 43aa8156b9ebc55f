//! One pipeline stage's slice of the model.
//!
//! A stage owns: the vision tower + projector when the config carries vision
//! fields, the token embedding on stage 0, a contiguous run of transformer
//! blocks, and the final norm + LM head on the last stage. The KV cache and
//! RoPE tables are created lazily on the first forward and persist across
//! calls, so callers must feed monotonically non-decreasing positions.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::debug;

use crate::config::ModelConfig;
use crate::kv_cache::KvCache;
use crate::layers::{precompute_cos_sin, rms_norm, RmsNorm, RopeTables};
use crate::vision::{VisionEncoder, VisionProjector};

use super::block::DecoderLayer;

#[derive(Default)]
pub struct StageInput {
    /// Token ids `[B, T]` (U32 or I64); stage 0 only.
    pub input_ids: Option<Tensor>,
    /// Hidden states `[B, T, D]` from the previous stage.
    pub hidden_in: Option<Tensor>,
    /// Pixel values `[B, C, H, W]`; requires the vision tower.
    pub images: Option<Tensor>,
    /// Optional attention mask (bool keep-mask or float additive).
    pub attn_mask: Option<Tensor>,
    /// Starting position of this call within the sequence.
    pub pos: usize,
}

#[derive(Debug)]
pub struct StageOutput {
    pub hidden_out: Tensor,
    /// Present on the last stage only.
    pub logits: Option<Tensor>,
}

pub struct ModelStage {
    cfg: ModelConfig,
    embed_tokens: Option<Embedding>,
    vision: Option<VisionEncoder>,
    projector: Option<VisionProjector>,
    layers: Vec<DecoderLayer>,
    final_norm: Option<RmsNorm>,
    lm_head: Option<Linear>,
    kv_cache: KvCache,
    rope: Option<RopeTables>,
}

impl ModelStage {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle_core::Error::wrap)?;

        let (vision, projector) = if cfg.has_vision() {
            (
                Some(VisionEncoder::new(cfg, vb.pp("vision"))?),
                Some(VisionProjector::new(cfg, vb.pp("projector"))?),
            )
        } else {
            (None, None)
        };

        let embed_tokens = if cfg.is_first_stage() && cfg.vocab_size > 0 {
            Some(embedding(
                cfg.vocab_size,
                cfg.hidden_size,
                vb.pp("embed_tokens"),
            )?)
        } else {
            None
        };

        let block_count = cfg.block_count();
        let mut layers = Vec::with_capacity(block_count);
        let vb_layers = vb.pp("layers");
        for i in 0..block_count {
            layers.push(DecoderLayer::new(cfg, i, vb_layers.pp(i))?);
        }

        let (final_norm, lm_head) = if cfg.is_last_stage() && cfg.vocab_size > 0 {
            (
                Some(rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?),
                Some(linear_no_bias(
                    cfg.hidden_size,
                    cfg.vocab_size,
                    vb.pp("lm_head"),
                )?),
            )
        } else {
            (None, None)
        };

        debug!(
            stage = cfg.stage_id,
            blocks = block_count,
            layer_start = cfg.layer_start,
            layer_end = cfg.layer_end,
            has_embedding = embed_tokens.is_some(),
            has_vision = vision.is_some(),
            has_lm_head = lm_head.is_some(),
            "constructed model stage"
        );

        Ok(Self {
            cfg: cfg.clone(),
            embed_tokens,
            vision,
            projector,
            layers,
            final_norm,
            lm_head,
            kv_cache: KvCache::new(),
            rope: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn block_count(&self) -> usize {
        self.layers.len()
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    /// Drop the sequence history so the stage can serve a fresh request.
    pub fn reset_cache(&mut self) -> Result<()> {
        self.kv_cache.clear_all().map_err(candle_core::Error::wrap)
    }

    /// One forward pass over a contiguous position range starting at `in.pos`.
    pub fn forward(&mut self, input: &StageInput) -> Result<StageOutput> {
        let mut hidden = match (&input.input_ids, &input.hidden_in) {
            (Some(ids), _) => {
                let embed = self
                    .embed_tokens
                    .as_ref()
                    .ok_or_else(|| candle_core::Error::Msg(
                        "stage: input_ids given but this stage has no embedding".to_string(),
                    ))?;
                let ids = if ids.dtype() == DType::I64 {
                    ids.to_dtype(DType::U32)?
                } else {
                    ids.clone()
                };
                Some(embed.forward(&ids)?)
            }
            (None, Some(h)) => Some(h.clone()),
            (None, None) => None,
        };

        if let Some(images) = &input.images {
            let encoder = self.vision.as_ref().ok_or_else(|| {
                candle_core::Error::Msg(
                    "stage: images given but this stage has no vision tower".to_string(),
                )
            })?;
            let mut vision_tokens = encoder.forward(images)?;
            if let Some(projector) = &self.projector {
                vision_tokens = projector.forward(&vision_tokens)?;
            }
            hidden = match hidden {
                Some(h) => {
                    let vision_tokens = vision_tokens
                        .to_dtype(h.dtype())?
                        .to_device(h.device())?;
                    Some(Tensor::cat(&[&vision_tokens, &h], 1)?)
                }
                None => Some(vision_tokens),
            };
        }

        let hidden = hidden.ok_or_else(|| {
            candle_core::Error::Msg("stage: neither input_ids, hidden_in nor images given".to_string())
        })?;
        let (_b, _t, d) = hidden.dims3()?;
        if d != self.cfg.hidden_size {
            candle_core::bail!(
                "stage: hidden size {d} does not match config hidden_size {}",
                self.cfg.hidden_size
            );
        }

        self.prepare_state(hidden.dtype(), hidden.device())?;

        let cache = if self.kv_cache.is_initialized() {
            Some(&self.kv_cache)
        } else {
            None
        };
        let rope = self.rope.as_ref();

        let mut hidden = hidden;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, input.attn_mask.as_ref(), cache, input.pos, rope)?;
        }

        let logits = match (&self.final_norm, &self.lm_head) {
            (Some(norm), Some(head)) => Some(head.forward(&norm.forward(&hidden)?)?),
            (None, Some(head)) => Some(head.forward(&hidden)?),
            _ => None,
        };

        Ok(StageOutput {
            hidden_out: hidden,
            logits,
        })
    }

    /// Lazily build the KV cache and RoPE tables for the observed
    /// dtype/device, rebuilding tables when they no longer fit.
    fn prepare_state(&mut self, dtype: DType, device: &Device) -> Result<()> {
        if self.layers.is_empty() {
            return Ok(());
        }
        if !self.kv_cache.is_initialized() {
            self.kv_cache
                .init(
                    self.layers.len(),
                    self.cfg.max_batch,
                    self.cfg.max_seq_len,
                    self.cfg.num_kv_heads(),
                    self.cfg.head_dim(),
                    dtype,
                    device,
                )
                .map_err(candle_core::Error::wrap)?;
            debug!(
                layers = self.layers.len(),
                max_batch = self.cfg.max_batch,
                max_seq_len = self.cfg.max_seq_len,
                "initialized kv cache"
            );
        }

        let rope_dim = self.cfg.rope_dim_or_default();
        if rope_dim > 0 {
            let needed = self.cfg.max_seq_len;
            let rebuild = match &self.rope {
                Some(tables) => !tables.is_compatible(needed, dtype, device),
                None => true,
            };
            if rebuild {
                self.rope = Some(precompute_cos_sin(
                    needed,
                    rope_dim,
                    self.cfg.rope_theta,
                    dtype,
                    device,
                )?);
                debug!(rope_dim, positions = needed, "built rope tables");
            }
        }
        Ok(())
    }
}
