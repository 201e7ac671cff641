//! Structured error kinds for the storage and integrity engine.
//!
//! Every fallible core operation returns a [`SiloError`]. Variants map
//! one-to-one onto the *kinds* callers are expected to branch on; the HTTP
//! layer (out of scope here) maps them onto status codes, the CLI maps them
//! onto exit codes and messages.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SiloError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate digest {digest}, already stored in topic {topic}")]
    Duplicate { digest: String, topic: String },

    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("parent asset not found: {0}")]
    ParentNotFound(String),

    #[error("topic '{0}' is unhealthy and read-only")]
    TopicUnhealthy(String),

    #[error("invalid topic name: {0}")]
    TopicNameInvalid(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("disk limit exceeded: {used} bytes used, limit {limit} bytes")]
    DiskLimitExceeded { used: u64, limit: u64 },

    #[error("corrupt header in {container} at offset {offset}: {reason}")]
    CorruptHeader {
        container: String,
        offset: u64,
        reason: String,
    },

    #[error("short read in {container} at offset {offset}")]
    ShortRead { container: String, offset: u64 },

    #[error("payload corrupt in {container} at offset {offset}")]
    PayloadCorrupt { container: String, offset: u64 },

    #[error("chain mismatch for container {container}: expected {expected}, computed {computed}")]
    ChainMismatch {
        container: String,
        expected: String,
        computed: String,
    },

    #[error("database busy")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SiloError {
    /// Machine-readable kind name, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            SiloError::NotFound(_) => "NotFound",
            SiloError::Duplicate { .. } => "Duplicate",
            SiloError::PayloadTooLarge { .. } => "PayloadTooLarge",
            SiloError::ParentNotFound(_) => "ParentNotFound",
            SiloError::TopicUnhealthy(_) => "TopicUnhealthy",
            SiloError::TopicNameInvalid(_) => "TopicNameInvalid",
            SiloError::InvalidArgument(_) => "InvalidArgument",
            SiloError::DiskLimitExceeded { .. } => "DiskLimitExceeded",
            SiloError::CorruptHeader { .. } => "CorruptHeader",
            SiloError::ShortRead { .. } => "ShortRead",
            SiloError::PayloadCorrupt { .. } => "PayloadCorrupt",
            SiloError::ChainMismatch { .. } => "ChainMismatch",
            SiloError::Busy => "Busy",
            SiloError::Cancelled => "Cancelled",
            SiloError::Io { .. } => "IoError",
            SiloError::Db(_) => "IoError",
            SiloError::Internal(_) => "Internal",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SiloError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SiloResult<T> = Result<T, SiloError>;
