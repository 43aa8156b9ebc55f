//! Rotary position embeddings with interleaved pair layout.
//!
//! Tables are `[max_seq_len, rope_dim]` where columns `2i` and `2i+1` carry
//! the same cos/sin value for pair `i`, matching the wire layout the weight
//! exporter produces. Only the first `rope_dim` components of each head are
//! rotated; the remainder passes through untouched.

use candle_core::{DType, Device, Result, Tensor};

pub struct RopeTables {
    pub cos: Tensor,
    pub sin: Tensor,
    pub rope_dim: usize,
}

/// Build cos/sin tables of shape `[seq_len, rope_dim]`.
///
/// Pair `i` at position `p` maps to angle `theta^(-2i/rope_dim) * p`.
pub fn precompute_cos_sin(
    seq_len: usize,
    rope_dim: usize,
    theta: f64,
    dtype: DType,
    device: &Device,
) -> Result<RopeTables> {
    if rope_dim == 0 || rope_dim % 2 != 0 {
        candle_core::bail!("rope: rope_dim must be a positive even number, got {rope_dim}");
    }
    if seq_len == 0 {
        candle_core::bail!("rope: seq_len must be > 0");
    }
    let half = rope_dim / 2;

    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1.0 / (theta as f32).powf(2.0 * i as f32 / rope_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let t = Tensor::arange(0u32, seq_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq_len, 1))?;
    let freqs = t.matmul(&inv_freq)?; // [seq_len, half]

    // Duplicate each pair's value into the even and odd column.
    let interleave = |half_table: Tensor| -> Result<Tensor> {
        Tensor::stack(&[&half_table, &half_table], 2)?.reshape((seq_len, rope_dim))
    };
    let cos = interleave(freqs.cos()?)?.to_dtype(dtype)?;
    let sin = interleave(freqs.sin()?)?.to_dtype(dtype)?;

    Ok(RopeTables { cos, sin, rope_dim })
}

impl RopeTables {
    pub fn max_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Whether these tables can serve a forward with the given requirements.
    pub fn is_compatible(&self, seq_len: usize, dtype: DType, device: &Device) -> bool {
        self.max_positions() >= seq_len
            && self.cos.dtype() == dtype
            && self.cos.device().same_device(device)
    }

    /// Rotate the first `rope_dim` components of q and k starting at `pos`.
    ///
    /// q and k are `[B, H, T, head_dim]` with `head_dim >= rope_dim`; the
    /// head counts may differ (GQA). Returns the rotated pair.
    pub fn apply(&self, q: &Tensor, k: &Tensor, pos: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, t, head_dim) = q.dims4()?;
        let (_bk, _hk, tk, head_dim_k) = k.dims4()?;
        if t != tk || head_dim != head_dim_k {
            candle_core::bail!(
                "rope: q {:?} and k {:?} must share seq_len and head_dim",
                q.dims(),
                k.dims()
            );
        }
        if head_dim < self.rope_dim {
            candle_core::bail!(
                "rope: head_dim {head_dim} is smaller than rope_dim {}",
                self.rope_dim
            );
        }
        if pos + t > self.max_positions() {
            candle_core::bail!(
                "rope: positions {}..{} exceed table length {}",
                pos,
                pos + t,
                self.max_positions()
            );
        }
        if q.dtype() != self.cos.dtype() || k.dtype() != self.cos.dtype() {
            candle_core::bail!(
                "rope: q/k dtype {:?}/{:?} must match table dtype {:?}",
                q.dtype(),
                k.dtype(),
                self.cos.dtype()
            );
        }

        let half = self.rope_dim / 2;
        // Even columns hold the per-pair values; view as pairs and take lane 0.
        let cos = self.cos.narrow(0, pos, t)?;
        let sin = self.sin.narrow(0, pos, t)?;
        let cos_half = cos.reshape((t, half, 2))?.narrow(2, 0, 1)?.squeeze(2)?;
        let sin_half = sin.reshape((t, half, 2))?.narrow(2, 0, 1)?.squeeze(2)?;
        let cos_half = cos_half.reshape((1, 1, t, half))?;
        let sin_half = sin_half.reshape((1, 1, t, half))?;

        let q = self.rotate(q, &cos_half, &sin_half)?;
        let k = self.rotate(k, &cos_half, &sin_half)?;
        Ok((q, k))
    }

    fn rotate(&self, x: &Tensor, cos_half: &Tensor, sin_half: &Tensor) -> Result<Tensor> {
        let (b, h, t, head_dim) = x.dims4()?;
        let half = self.rope_dim / 2;

        let x_rope = x.narrow(3, 0, self.rope_dim)?.contiguous()?;
        let pairs = x_rope.reshape((b, h, t, half, 2))?;
        let x1 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let x2 = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let y1 = (x1.broadcast_mul(cos_half)? - x2.broadcast_mul(sin_half)?)?;
        let y2 = (x1.broadcast_mul(sin_half)? + x2.broadcast_mul(cos_half)?)?;
        let rotated = Tensor::stack(&[&y1, &y2], 4)?.reshape((b, h, t, self.rope_dim))?;

        if head_dim > self.rope_dim {
            let pass = x.narrow(3, self.rope_dim, head_dim - self.rope_dim)?;
            Tensor::cat(&[&rotated, &pass], 3)
        } else {
            Ok(rotated)
        }
    }
}
