use candle_core::DType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache is already initialized")]
    AlreadyInitialized,

    #[error("cache is not initialized")]
    NotInitialized,

    #[error("layer index {index} out of range (stage owns {num_layers} layers)")]
    LayerOutOfRange { index: usize, num_layers: usize },

    #[error("append of {new_tokens} tokens at pos {pos} exceeds max_seq_len {max_seq_len}")]
    AppendBeyondCapacity {
        pos: usize,
        new_tokens: usize,
        max_seq_len: usize,
    },

    #[error("batch size {got} exceeds max_batch {max_batch}")]
    BatchTooLarge { got: usize, max_batch: usize },

    #[error("k/v append shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("k/v dtype mismatch: cache holds {expected:?}, append has {got:?}")]
    DtypeMismatch { expected: DType, got: DType },

    #[error("prefix read of {requested} positions exceeds valid capacity {max_seq_len}")]
    PrefixBeyondCapacity {
        requested: usize,
        max_seq_len: usize,
    },

    #[error("packed k/v layer count {got} does not match cache layer count {expected}")]
    LayerCountMismatch { got: usize, expected: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
