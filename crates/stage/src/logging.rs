//! Logging bootstrap for stage processes.
//!
//! `RUST_LOG` controls level filtering (default: info). Set
//! `PIPELM_LOG_FORMAT=json` for JSON output suitable for log aggregation;
//! anything else selects human-readable output.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("PIPELM_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match LogFormat::from_env() {
        LogFormat::Json => {
            fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        }
        LogFormat::Pretty => {
            fmt().with_env_filter(filter).with_target(false).init();
        }
    }
}
