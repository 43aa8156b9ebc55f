pub mod engine;
pub mod error;
pub mod wire;

pub use engine::{KvCache, LayerKv};
pub use error::CacheError;
pub use wire::{pack_kv_cache, restore_kv_cache, PackedKv};
