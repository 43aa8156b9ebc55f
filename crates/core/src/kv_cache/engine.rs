//! Preallocated per-layer KV slabs with bounded append semantics.
//!
//! Each local layer owns two `[max_batch, kv_heads, max_seq_len, head_dim]`
//! tensors. `append` writes new K/V into `[:B, :, pos:pos+T, :]` through
//! `slice_set`; the prefix `[:, :, :pos+T, :]` is the valid history and
//! everything past it is undefined. Single-writer per stage, no locking.

use candle_core::{DType, Device, Tensor};

use super::error::CacheError;
use crate::tensor_util::shape_str;

pub struct LayerKv {
    pub k: Tensor,
    pub v: Tensor,
}

pub struct KvCache {
    layers: Vec<LayerKv>,
    max_batch: usize,
    max_seq_len: usize,
    kv_heads: usize,
    head_dim: usize,
    dtype: DType,
    initialized: bool,
}

impl Default for KvCache {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            max_batch: 0,
            max_seq_len: 0,
            kv_heads: 0,
            head_dim: 0,
            dtype: DType::F32,
            initialized: false,
        }
    }
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot allocation of every layer slab. A second init fails.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        num_layers: usize,
        max_batch: usize,
        max_seq_len: usize,
        kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(), CacheError> {
        if self.initialized {
            return Err(CacheError::AlreadyInitialized);
        }
        let shape = (max_batch, kv_heads, max_seq_len, head_dim);
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layers.push(LayerKv {
                k: Tensor::zeros(shape, dtype, device)?,
                v: Tensor::zeros(shape, dtype, device)?,
            });
        }
        self.layers = layers;
        self.max_batch = max_batch;
        self.max_seq_len = max_seq_len;
        self.kv_heads = kv_heads;
        self.head_dim = head_dim;
        self.dtype = dtype;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layer(&self, index: usize) -> Result<&LayerKv, CacheError> {
        if !self.initialized {
            return Err(CacheError::NotInitialized);
        }
        self.layers
            .get(index)
            .ok_or(CacheError::LayerOutOfRange {
                index,
                num_layers: self.layers.len(),
            })
    }

    /// Write `[B, kv_heads, T, head_dim]` K/V into layer `index` at `pos`.
    ///
    /// Every constraint is validated before any write, so a failed append
    /// never leaves a partial update behind.
    pub fn append(
        &self,
        index: usize,
        new_k: &Tensor,
        new_v: &Tensor,
        pos: usize,
    ) -> Result<(), CacheError> {
        let layer = self.layer(index)?;

        if new_k.dtype() != self.dtype {
            return Err(CacheError::DtypeMismatch {
                expected: self.dtype,
                got: new_k.dtype(),
            });
        }
        if new_v.dtype() != self.dtype {
            return Err(CacheError::DtypeMismatch {
                expected: self.dtype,
                got: new_v.dtype(),
            });
        }
        let k_dims = new_k.dims().to_vec();
        if k_dims.len() != 4 || new_v.dims() != k_dims.as_slice() {
            return Err(CacheError::ShapeMismatch {
                expected: format!(
                    "[B<={}, {}, T, {}] with matching v",
                    self.max_batch, self.kv_heads, self.head_dim
                ),
                got: format!("k {} v {}", shape_str(new_k.dims()), shape_str(new_v.dims())),
            });
        }
        let (batch, kv_heads, new_tokens, head_dim) =
            (k_dims[0], k_dims[1], k_dims[2], k_dims[3]);
        if kv_heads != self.kv_heads || head_dim != self.head_dim {
            return Err(CacheError::ShapeMismatch {
                expected: format!(
                    "[B<={}, {}, T, {}]",
                    self.max_batch, self.kv_heads, self.head_dim
                ),
                got: shape_str(&k_dims),
            });
        }
        if batch > self.max_batch {
            return Err(CacheError::BatchTooLarge {
                got: batch,
                max_batch: self.max_batch,
            });
        }
        if pos + new_tokens > self.max_seq_len {
            return Err(CacheError::AppendBeyondCapacity {
                pos,
                new_tokens,
                max_seq_len: self.max_seq_len,
            });
        }

        // Prefix views along the batch dim stay contiguous, so slice_set
        // writes through the shared slab storage.
        let dst_k = layer.k.narrow(0, 0, batch)?;
        let dst_v = layer.v.narrow(0, 0, batch)?;
        dst_k.slice_set(&new_k.contiguous()?, 2, pos)?;
        dst_v.slice_set(&new_v.contiguous()?, 2, pos)?;
        Ok(())
    }

    /// Read the valid history `[0:batch, :, 0:len, :]` of a layer as
    /// contiguous tensors.
    pub fn prefix(
        &self,
        index: usize,
        batch: usize,
        len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let layer = self.layer(index)?;
        if batch > self.max_batch {
            return Err(CacheError::BatchTooLarge {
                got: batch,
                max_batch: self.max_batch,
            });
        }
        if len > self.max_seq_len {
            return Err(CacheError::PrefixBeyondCapacity {
                requested: len,
                max_seq_len: self.max_seq_len,
            });
        }
        let k = layer.k.narrow(0, 0, batch)?.narrow(2, 0, len)?.contiguous()?;
        let v = layer.v.narrow(0, 0, batch)?.narrow(2, 0, len)?.contiguous()?;
        Ok((k, v))
    }

    /// Zero every slab without deallocating.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        if !self.initialized {
            return Ok(());
        }
        for layer in &self.layers {
            let zeros = layer.k.zeros_like()?;
            layer.k.slice_set(&zeros, 0, 0)?;
            layer.v.slice_set(&zeros, 0, 0)?;
        }
        Ok(())
    }
}
