//! Error taxonomy for xerp-core, tiered per the runtime consequence of each
//! failure: usage errors abort with no side effects, per-file errors are
//! collected and skipped, store errors roll back and abort, vector errors
//! degrade gracefully, and invariant violations are fatal in debug builds
//! only.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, XerpError>;

#[derive(Debug, thiserror::Error)]
pub enum XerpError {
    /// Bad CLI arguments or bad config. Exit code 1, no side effects.
    #[error("{0}")]
    Input(String),

    /// A single file failed to read or parse. Collected by the indexer,
    /// never aborts the run.
    #[error("{path}: {reason}")]
    PerFile { path: PathBuf, reason: String },

    /// Persistence layer failure mid-transaction. Exit code 2.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Missing/corrupt ANN index or vector blob. Callers degrade to
    /// exact-only retrieval with a warning instead of propagating this.
    #[error("vector error: {0}")]
    Vector(String),

    /// An invariant from the data model was violated. Fatal in debug
    /// builds via `debug_assert!`; in release the offending item is
    /// discarded and this is logged.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl XerpError {
    /// Maps an error to the process exit code it should produce, per the
    /// CLI contract: 0 success, 1 usage/validation, 2 core runtime error.
    pub fn exit_code(&self) -> i32 {
        match self {
            XerpError::Input(_) => 1,
            XerpError::PerFile { .. } => 2,
            XerpError::Store(_) => 2,
            XerpError::Vector(_) => 2,
            XerpError::Invariant(_) => 2,
        }
    }
}

/// Report a broken invariant: panics in debug builds, logs and continues in
/// release. Returns `true` if the caller should discard the offending item.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($msg:tt)+) => {{
        let ok = $cond;
        if !ok {
            let msg = format!($($msg)+);
            debug_assert!(ok, "{}", msg);
            tracing::error!(invariant = %msg, "invariant violated, discarding");
        }
        ok
    }};
}

/// A per-file failure recorded during a scan, kept alongside a run summary
/// rather than aborting the whole indexing pass.
#[derive(Debug, Clone)]
pub struct PerFileError {
    pub path: PathBuf,
    pub reason: String,
}
