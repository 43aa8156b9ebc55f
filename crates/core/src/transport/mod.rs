//! Inter-stage transport: length-prefixed TCP framing for activation and
//! KV packets.
//!
//! All integers travel in network byte order; tensor payloads are raw
//! little-endian CPU bytes. One blocking TCP connection per adjacent stage
//! pair; a connection loss is fatal to the stage.

pub mod error;
pub mod tcp;
pub mod wire;

pub use error::TransportError;
pub use tcp::{StageLink, StageListener};
pub use wire::{
    read_activation, read_kv, write_activation, write_kv, MAX_TENSOR_NDIM, WIRE_VERSION,
};

use candle_core::Tensor;

/// Hidden-state payload sent between adjacent stages after a forward.
#[derive(Debug, Clone)]
pub struct ActivationPacket {
    pub version: i32,
    pub stage_from: i32,
    pub stage_to: i32,
    pub step: i64,
    pub pos: i64,
    /// `[B, T, D]` hidden states.
    pub hidden: Tensor,
    pub attn_mask: Option<Tensor>,
}

/// KV migration payload. Reserved; not used in steady-state forwarding.
#[derive(Debug, Clone)]
pub struct KvPacket {
    pub version: i32,
    pub stage_from: i32,
    pub stage_to: i32,
    pub step: i64,
    pub pos: i64,
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
}
