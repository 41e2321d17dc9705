use thiserror::Error;

use crate::types::ShardId;

/// Convenience alias for `Result<T, MergeError>`.
pub type MergeResult<T> = Result<T, MergeError>;

/// Error classification for the caller's abort/retry decisions.
///
/// - `Configuration`: query-shape metadata inconsistent with the shard schema
/// - `ShardIo`: a shard cursor failed; the shard-execution layer may retry
/// - `Type`: aggregated values have no usable ordering/arithmetic
/// - `Transient`: resource guard tripped or merge cancelled
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ShardIo,
    Type,
    Transient,
    InternalBug,
}

/// Top-level error for a merge. Every variant aborts the merge; the engine
/// never returns a partially merged result.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shard I/O error on {shard_id}: {source}")]
    ShardIo {
        shard_id: ShardId,
        #[source]
        source: CursorError,
    },

    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// Transient resource error (buffer limit exceeded).
    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    #[error("Merge cancelled: {0}")]
    Cancelled(String),

    /// Internal bug. Always carries a unique `error_code` and `debug_context`.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Query-shape / schema configuration errors. Raised at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Column index {index} out of bounds (column count {column_count})")]
    ColumnOutOfBounds { index: usize, column_count: usize },

    #[error("{shard_id} schema mismatch: {reason}")]
    SchemaMismatch { shard_id: ShardId, reason: String },

    #[error("Invalid aggregation projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid merge config: {0}")]
    InvalidConfig(String),
}

/// Errors reported by a shard cursor implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Cursor already closed")]
    Closed,

    #[error("Column index {0} out of bounds")]
    ColumnOutOfBounds(usize),

    #[error("No current row")]
    NoCurrentRow,
}

impl From<std::io::Error> for CursorError {
    fn from(e: std::io::Error) -> Self {
        CursorError::Io(e.to_string())
    }
}

/// Aggregation type errors. Raised from `merge`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("{func} cannot combine {left} with {right}")]
    Incompatible {
        func: &'static str,
        left: String,
        right: String,
    },

    #[error("{func} requires a numeric value, got {got}")]
    NotNumeric { func: &'static str, got: String },

    #[error("{func} overflowed {ty}")]
    Overflow { func: &'static str, ty: String },
}

impl MergeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::Config(_) => ErrorKind::Configuration,
            MergeError::Cursor(_) => ErrorKind::Configuration,
            MergeError::ShardIo { .. } => ErrorKind::ShardIo,
            MergeError::Type(_) => ErrorKind::Type,
            MergeError::Transient { .. } => ErrorKind::Transient,
            MergeError::Cancelled(_) => ErrorKind::Transient,
            MergeError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Map to a PostgreSQL SQLSTATE code for the protocol layer.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            MergeError::Config(ConfigError::UnknownColumn(_)) => "42703", // undefined_column
            MergeError::Config(ConfigError::ColumnOutOfBounds { .. }) => "42703",
            MergeError::Config(ConfigError::InvalidProjection(_)) => "42803", // grouping_error
            MergeError::Config(_) => "XX000",
            MergeError::Cursor(_) => "24000", // invalid_cursor_state
            MergeError::ShardIo { .. } => "08006", // connection_failure
            MergeError::Type(TypeError::Incompatible { .. }) => "42804", // datatype_mismatch
            MergeError::Type(TypeError::NotNumeric { .. }) => "42804",
            MergeError::Type(TypeError::Overflow { .. }) => "22003", // numeric_value_out_of_range
            MergeError::Transient { .. } => "53000", // insufficient_resources
            MergeError::Cancelled(_) => "57014",    // query_canceled
            MergeError::InternalBug { .. } => "XX000",
        }
    }

    /// Wrap a cursor failure with the shard it came from.
    pub fn shard_io(shard_id: ShardId, source: CursorError) -> Self {
        MergeError::ShardIo { shard_id, source }
    }

    /// Construct a transient resource error.
    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        MergeError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        MergeError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }
}
