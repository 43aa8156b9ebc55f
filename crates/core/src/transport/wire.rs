//! Wire framing primitives.
//!
//! Generic over `Read`/`Write` so packets serialize identically into a TCP
//! stream or an in-memory buffer. Integer fields are big-endian; tensor
//! payloads are little-endian CPU bytes prefixed by dtype code, dims and
//! byte count, with a leading `defined` byte as the option discriminant.

use std::io::{Read, Write};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use super::error::TransportError;
use super::{ActivationPacket, KvPacket};

pub const WIRE_VERSION: i32 = 1;
pub const MAX_TENSOR_NDIM: usize = 16;

// Stable numeric dtype identifiers; receivers reject unknown codes.
fn dtype_code(dtype: DType) -> Result<i32, TransportError> {
    match dtype {
        DType::U8 => Ok(0),
        DType::U32 => Ok(1),
        DType::I64 => Ok(2),
        DType::BF16 => Ok(3),
        DType::F16 => Ok(4),
        DType::F32 => Ok(5),
        DType::F64 => Ok(6),
        other => Err(TransportError::UnsupportedDtype(format!("{other:?}"))),
    }
}

fn dtype_from_code(code: i32) -> Result<DType, TransportError> {
    match code {
        0 => Ok(DType::U8),
        1 => Ok(DType::U32),
        2 => Ok(DType::I64),
        3 => Ok(DType::BF16),
        4 => Ok(DType::F16),
        5 => Ok(DType::F32),
        6 => Ok(DType::F64),
        other => Err(TransportError::Framing(format!(
            "unknown dtype code {other}"
        ))),
    }
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<(), TransportError> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<(), TransportError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<(), TransportError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<(), TransportError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, TransportError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, TransportError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, TransportError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, TransportError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn tensor_payload(t: &Tensor) -> Result<Vec<u8>, TransportError> {
    let flat = t.flatten_all()?;
    let bytes = match t.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => flat
            .to_vec1::<u32>()?
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect(),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .into_iter()
            .flat_map(i64::to_le_bytes)
            .collect(),
        DType::BF16 => flat
            .to_vec1::<bf16>()?
            .into_iter()
            .flat_map(|v| v.to_bits().to_le_bytes())
            .collect(),
        DType::F16 => flat
            .to_vec1::<f16>()?
            .into_iter()
            .flat_map(|v| v.to_bits().to_le_bytes())
            .collect(),
        DType::F32 => flat
            .to_vec1::<f32>()?
            .into_iter()
            .flat_map(f32::to_le_bytes)
            .collect(),
        DType::F64 => flat
            .to_vec1::<f64>()?
            .into_iter()
            .flat_map(f64::to_le_bytes)
            .collect(),
        other => return Err(TransportError::UnsupportedDtype(format!("{other:?}"))),
    };
    Ok(bytes)
}

fn tensor_from_payload(
    dtype: DType,
    dims: &[usize],
    bytes: &[u8],
) -> Result<Tensor, TransportError> {
    let device = Device::Cpu;
    let t = match dtype {
        DType::U8 => Tensor::from_vec(bytes.to_vec(), dims, &device)?,
        DType::U32 => {
            let v: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DType::I64 => {
            let v: Vec<i64> = bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DType::BF16 => {
            let v: Vec<bf16> = bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DType::F16 => {
            let v: Vec<f16> = bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DType::F32 => {
            let v: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DType::F64 => {
            let v: Vec<f64> = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        other => return Err(TransportError::UnsupportedDtype(format!("{other:?}"))),
    };
    Ok(t)
}

/// Write an optional tensor. Absent tensors are a single zero byte.
///
/// Present tensors are moved to CPU and made contiguous before their bytes
/// go on the wire.
pub fn write_tensor_opt<W: Write>(
    w: &mut W,
    tensor: Option<&Tensor>,
) -> Result<(), TransportError> {
    let Some(tensor) = tensor else {
        return write_u8(w, 0);
    };
    write_u8(w, 1)?;

    let cpu = tensor.to_device(&Device::Cpu)?.contiguous()?;
    let dims = cpu.dims();
    if dims.len() > MAX_TENSOR_NDIM {
        return Err(TransportError::Framing(format!(
            "tensor has {} dims, max is {MAX_TENSOR_NDIM}",
            dims.len()
        )));
    }

    write_i32(w, dtype_code(cpu.dtype())?)?;
    write_i32(w, dims.len() as i32)?;
    for &dim in dims {
        write_i64(w, dim as i64)?;
    }
    let payload = tensor_payload(&cpu)?;
    write_u64(w, payload.len() as u64)?;
    w.write_all(&payload)?;
    Ok(())
}

/// Read an optional tensor, materialized on CPU.
///
/// Rejects unknown dtype codes, out-of-range `ndim`, negative dims, and a
/// byte count disagreeing with `sizes x dtype`.
pub fn read_tensor_opt<R: Read>(r: &mut R) -> Result<Option<Tensor>, TransportError> {
    if read_u8(r)? == 0 {
        return Ok(None);
    }

    let dtype = dtype_from_code(read_i32(r)?)?;
    let ndim = read_i32(r)?;
    if !(0..=MAX_TENSOR_NDIM as i32).contains(&ndim) {
        return Err(TransportError::Framing(format!("invalid ndim {ndim}")));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let dim = read_i64(r)?;
        if dim < 0 {
            return Err(TransportError::Framing(format!("negative dim {dim}")));
        }
        dims.push(dim as usize);
    }

    let nbytes = read_u64(r)?;
    let expected = dims.iter().product::<usize>() as u64 * dtype.size_in_bytes() as u64;
    if nbytes != expected {
        return Err(TransportError::Framing(format!(
            "payload of {nbytes} bytes disagrees with shape/dtype ({expected} expected)"
        )));
    }

    let mut payload = vec![0u8; nbytes as usize];
    r.read_exact(&mut payload)?;
    Ok(Some(tensor_from_payload(dtype, &dims, &payload)?))
}

fn write_header<W: Write>(
    w: &mut W,
    version: i32,
    stage_from: i32,
    stage_to: i32,
    step: i64,
    pos: i64,
) -> Result<(), TransportError> {
    write_i32(w, version)?;
    write_i32(w, stage_from)?;
    write_i32(w, stage_to)?;
    write_i64(w, step)?;
    write_i64(w, pos)?;
    Ok(())
}

fn read_header<R: Read>(r: &mut R) -> Result<(i32, i32, i32, i64, i64), TransportError> {
    let version = read_i32(r)?;
    if version != WIRE_VERSION {
        return Err(TransportError::VersionMismatch {
            got: version,
            expected: WIRE_VERSION,
        });
    }
    let stage_from = read_i32(r)?;
    let stage_to = read_i32(r)?;
    let step = read_i64(r)?;
    let pos = read_i64(r)?;
    Ok((version, stage_from, stage_to, step, pos))
}

pub fn write_activation<W: Write>(
    w: &mut W,
    packet: &ActivationPacket,
) -> Result<(), TransportError> {
    write_header(
        w,
        packet.version,
        packet.stage_from,
        packet.stage_to,
        packet.step,
        packet.pos,
    )?;
    write_tensor_opt(w, Some(&packet.hidden))?;
    write_tensor_opt(w, packet.attn_mask.as_ref())?;
    Ok(())
}

pub fn read_activation<R: Read>(r: &mut R) -> Result<ActivationPacket, TransportError> {
    let (version, stage_from, stage_to, step, pos) = read_header(r)?;
    let hidden = read_tensor_opt(r)?
        .ok_or_else(|| TransportError::Framing("activation packet without hidden".to_string()))?;
    let attn_mask = read_tensor_opt(r)?;
    Ok(ActivationPacket {
        version,
        stage_from,
        stage_to,
        step,
        pos,
        hidden,
        attn_mask,
    })
}

pub fn write_kv<W: Write>(w: &mut W, packet: &KvPacket) -> Result<(), TransportError> {
    write_header(
        w,
        packet.version,
        packet.stage_from,
        packet.stage_to,
        packet.step,
        packet.pos,
    )?;
    write_tensor_opt(w, packet.k.as_ref())?;
    write_tensor_opt(w, packet.v.as_ref())?;
    Ok(())
}

pub fn read_kv<R: Read>(r: &mut R) -> Result<KvPacket, TransportError> {
    let (version, stage_from, stage_to, step, pos) = read_header(r)?;
    let k = read_tensor_opt(r)?;
    let v = read_tensor_opt(r)?;
    Ok(KvPacket {
        version,
        stage_from,
        stage_to,
        step,
        pos,
        k,
        v,
    })
}
