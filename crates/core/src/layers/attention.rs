//! Grouped-query self-attention with optional QK-norm, RoPE and KV cache.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::mask::{apply_attention_mask, causal_mask};
use super::normalization::{apply_per_head_norm, rms_norm, RmsNorm};
use super::rotary::RopeTables;
use crate::config::ModelConfig;
use crate::kv_cache::KvCache;

pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    layer_index: usize,
}

impl Attention {
    pub fn new(cfg: &ModelConfig, layer_index: usize, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        if num_heads == 0 {
            candle_core::bail!("attention: num_attention_heads must be > 0");
        }
        if cfg.hidden_size % num_heads != 0 {
            candle_core::bail!(
                "attention: hidden_size must be divisible by num_attention_heads ({} % {})",
                cfg.hidden_size,
                num_heads
            );
        }
        if num_kv_heads > num_heads {
            candle_core::bail!(
                "attention: num_key_value_heads {num_kv_heads} must not exceed num_attention_heads {num_heads}"
            );
        }
        if num_heads % num_kv_heads != 0 {
            candle_core::bail!(
                "attention: num_attention_heads {num_heads} must be divisible by num_key_value_heads {num_kv_heads}"
            );
        }
        let head_dim = cfg.hidden_size / num_heads;

        let q_proj = linear_no_bias(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        let (q_norm, k_norm) = if cfg.use_qk_norm {
            (
                Some(rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?),
                Some(rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            layer_index,
        })
    }

    /// One attention pass over `[B, T, D]` starting at position `pos`.
    ///
    /// With a cache, new K/V are appended at `pos` for this layer and the
    /// full prefix `[:, :, :pos+T, :]` is attended; without one, only the
    /// current window is used. A `None` mask means causal within the window.
    pub fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: Option<&KvCache>,
        pos: usize,
        rope: Option<&RopeTables>,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _hidden) = xs.dims3()?;

        let q = self.q_proj.forward(xs)?;
        let k = self.k_proj.forward(xs)?;
        let v = self.v_proj.forward(xs)?;

        let q = q
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = match &self.q_norm {
            Some(norm) => apply_per_head_norm(&q, norm)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => apply_per_head_norm(&k, norm)?,
            None => k,
        };

        // The rotation is per-position, identical across heads, so applying
        // it in the kv-head space equals rotate-after-repeat.
        let (q, k) = match rope {
            Some(tables) if tables.rope_dim > 0 => tables.apply(&q, &k, pos)?,
            _ => (q, k),
        };

        let (k_all, v_all) = match cache {
            Some(cache) if cache.is_initialized() => {
                cache
                    .append(self.layer_index, &k, &v, pos)
                    .map_err(|e| candle_core::Error::Msg(format!("cache append: {e}")))?;
                cache
                    .prefix(self.layer_index, b_sz, pos + q_len)
                    .map_err(|e| candle_core::Error::Msg(format!("cache read: {e}")))?
            }
            _ => (k, v),
        };

        // GQA: repeat each KV head to cover its group of query heads.
        let num_kv_groups = self.num_heads / self.num_kv_heads;
        let k_all = repeat_kv(k_all, num_kv_groups)?;
        let v_all = repeat_kv(v_all, num_kv_groups)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k_all.transpose(2, 3)?)? * scale)?;

        let scores = match attention_mask {
            Some(mask) => apply_attention_mask(&scores, mask)?,
            None => {
                // Query t attends keys up to offset + t; the offset is the
                // cached history length (zero without a cache).
                let total = k_all.dim(2)?;
                let mask = causal_mask(q_len, total - q_len, scores.dtype(), scores.device())?;
                scores.broadcast_add(&mask)?
            }
        };

        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs.matmul(&v_all)?;
        let context = context
            .transpose(1, 2)?
            .reshape((b_sz, q_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&context)
    }
}

/// Repeat KV heads for grouped-query attention: head `h` covers query heads
/// `h * groups .. (h+1) * groups`.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_kv_heads * num_kv_groups, s, d))
}
