use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("unsupported wire version {got} (expected {expected})")]
    VersionMismatch { got: i32, expected: i32 },

    #[error("unsupported tensor dtype on the wire: {0}")]
    UnsupportedDtype(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_names_both_versions() {
        let e = TransportError::VersionMismatch {
            got: 2,
            expected: 1,
        };
        assert_eq!(e.to_string(), "unsupported wire version 2 (expected 1)");
    }
}
