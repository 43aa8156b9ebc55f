//! Packing helpers for KV migration.
//!
//! `pack_kv_cache` stacks every layer's K/V into `[L, B, H_kv, S, head_dim]`
//! CPU tensors suitable for a `KvPacket`; `restore_kv_cache` writes such a
//! pair back into an initialized cache on the receiving stage.

use candle_core::{Device, Tensor};

use super::engine::KvCache;
use super::error::CacheError;

pub struct PackedKv {
    pub k: Tensor,
    pub v: Tensor,
}

/// Stack all layer slabs into CPU tensors of shape `[L, B, H_kv, S, head_dim]`.
pub fn pack_kv_cache(cache: &KvCache) -> Result<Option<PackedKv>, CacheError> {
    if !cache.is_initialized() {
        return Ok(None);
    }
    let num_layers = cache.num_layers();
    let mut ks = Vec::with_capacity(num_layers);
    let mut vs = Vec::with_capacity(num_layers);
    for i in 0..num_layers {
        let layer = cache.layer(i)?;
        ks.push(layer.k.to_device(&Device::Cpu)?.contiguous()?);
        vs.push(layer.v.to_device(&Device::Cpu)?.contiguous()?);
    }
    let k = Tensor::stack(&ks, 0)?;
    let v = Tensor::stack(&vs, 0)?;
    Ok(Some(PackedKv { k, v }))
}

/// Write packed `[L, B, H_kv, S, head_dim]` tensors back into the cache.
pub fn restore_kv_cache(cache: &KvCache, k: &Tensor, v: &Tensor) -> Result<(), CacheError> {
    if !cache.is_initialized() {
        return Err(CacheError::NotInitialized);
    }
    if k.rank() != 5 || v.rank() != 5 || k.dims() != v.dims() {
        return Err(CacheError::ShapeMismatch {
            expected: "[L, B, H_kv, S, head_dim] with matching v".to_string(),
            got: format!("k {:?} v {:?}", k.dims(), v.dims()),
        });
    }
    if k.dims()[0] != cache.num_layers() {
        return Err(CacheError::LayerCountMismatch {
            got: k.dims()[0],
            expected: cache.num_layers(),
        });
    }
    for i in 0..cache.num_layers() {
        let layer = cache.layer(i)?;
        let k_i = k
            .narrow(0, i, 1)?
            .squeeze(0)?
            .to_device(layer.k.device())?
            .to_dtype(layer.k.dtype())?
            .contiguous()?;
        let v_i = v
            .narrow(0, i, 1)?
            .squeeze(0)?
            .to_device(layer.v.device())?
            .to_dtype(layer.v.dtype())?
            .contiguous()?;
        layer.k.slice_set(&k_i, 0, 0)?;
        layer.v.slice_set(&v_i, 0, 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn init_cache() -> KvCache {
        let mut cache = KvCache::new();
        cache
            .init(2, 1, 4, 2, 4, DType::F32, &Device::Cpu)
            .unwrap();
        cache
    }

    #[test]
    fn pack_of_uninitialized_cache_is_none() {
        let cache = KvCache::new();
        assert!(pack_kv_cache(&cache).unwrap().is_none());
    }

    #[test]
    fn pack_then_restore_round_trips() {
        let src = init_cache();
        let k = Tensor::full(3f32, (1, 2, 2, 4), &Device::Cpu).unwrap();
        let v = Tensor::full(7f32, (1, 2, 2, 4), &Device::Cpu).unwrap();
        src.append(0, &k, &v, 0).unwrap();
        src.append(1, &k, &v, 1).unwrap();

        let packed = pack_kv_cache(&src).unwrap().unwrap();
        assert_eq!(packed.k.dims(), &[2, 1, 2, 4, 4]);

        let dst = init_cache();
        restore_kv_cache(&dst, &packed.k, &packed.v).unwrap();

        for layer in 0..2 {
            let (sk, sv) = src.prefix(layer, 1, 4).unwrap();
            let (dk, dv) = dst.prefix(layer, 1, 4).unwrap();
            let dk_vals: Vec<f32> = dk.flatten_all().unwrap().to_vec1().unwrap();
            let sk_vals: Vec<f32> = sk.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(dk_vals, sk_vals);
            let dv_vals: Vec<f32> = dv.flatten_all().unwrap().to_vec1().unwrap();
            let sv_vals: Vec<f32> = sv.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(dv_vals, sv_vals);
        }
    }

    #[test]
    fn restore_rejects_layer_count_mismatch() {
        let dst = init_cache();
        let k = Tensor::zeros((3, 1, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            restore_kv_cache(&dst, &k, &k),
            Err(CacheError::LayerCountMismatch { .. })
        ));
    }

    #[test]
    fn restore_rejects_wrong_rank() {
        let dst = init_cache();
        let k = Tensor::zeros((2, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            restore_kv_cache(&dst, &k, &k),
            Err(CacheError::ShapeMismatch { .. })
        ));
    }
}
