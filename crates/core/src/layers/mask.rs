use candle_core::{DType, Device, Result, Tensor};

/// Large negative fill for masked-out scores. Finite so that bf16/f16
/// softmax stays NaN-free even when a row is fully masked.
const MASK_FILL: f32 = -1e9;

/// Additive causal mask of shape `[1, 1, seq_len, seq_len + seqlen_offset]`.
///
/// Query position `t` may attend to key positions `j <= seqlen_offset + t`.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| if j > i + seqlen_offset { MASK_FILL } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    mask.to_dtype(dtype)
}

/// Apply a caller-supplied attention mask to raw scores `[B, H, T, S]`.
///
/// A `U8` mask is a boolean keep-mask (`1` = attend): scores where keep is
/// false are filled with a large negative constant. Any float mask is added
/// to the scores after a dtype cast.
pub fn apply_attention_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if mask.dtype() == DType::U8 {
        let keep = mask.broadcast_as(scores.shape())?;
        let fill = Tensor::full(MASK_FILL, scores.shape(), scores.device())?
            .to_dtype(scores.dtype())?;
        keep.where_cond(scores, &fill)
    } else {
        let mask = mask.to_dtype(scores.dtype())?;
        scores.broadcast_add(&mask)
    }
}
