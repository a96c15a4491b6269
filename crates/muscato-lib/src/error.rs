//! Typed failure kinds for the matching engine.
//!
//! Every kind here is fatal: stages propagate the first error upward and the
//! driver exits non-zero.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// File missing, read/write failure, or codec framing error.
    #[error("{context}: {source}")]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream declared sorted contained a descending key.
    #[error("{stream}: sort order violation at line {line}")]
    SortOrderViolation { stream: String, line: u64 },

    /// Field count or numeric parse failure in an intermediate stream.
    #[error("{stream}: malformed record: {reason}")]
    MalformedRecord { stream: String, reason: String },

    /// A configured offset yielded zero windowed reads. This means the window
    /// configuration is impossible against the read corpus.
    #[error("window {window} (offset {offset}) produced no valid reads")]
    EmptyWindow { window: usize, offset: usize },

    /// Missing or contradictory configuration parameter.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Cooperative cancellation was signalled.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Wrap an I/O failure with the path or operation it belongs to.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::IoError {
            context: context.into(),
            source,
        }
    }
}
