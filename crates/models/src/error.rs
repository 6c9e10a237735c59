use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("darknet weights too short for header ({len} bytes)")]
    TruncatedHeader { len: usize },
    #[error("darknet weights payload is not a whole number of f32 values ({len} bytes)")]
    MisalignedPayload { len: usize },
    #[error("darknet weights exhausted at {layer}: needed {needed} values, {available} left")]
    TruncatedWeights {
        layer: String,
        needed: usize,
        available: usize,
    },
    #[error("invalid detector config: {0}")]
    Config(String),
}
