use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, HermesError>;

/// Crate-wide error taxonomy.
///
/// `RerankTimeout` never escapes the search pipeline: it is converted into a
/// degraded response (`rerank_skipped = true`). Everything else surfaces to
/// the caller with its cause attached.
#[derive(Debug, thiserror::Error)]
pub enum HermesError {
    /// Rejected at load time; never raised during a query.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The scan found no files, or chunking produced no chunks.
    #[error("index build produced nothing: {0}")]
    IndexBuildEmpty(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata store open/read/write failed. An i/o-class failure.
    #[error("metadata store failure: {0}")]
    Store(#[from] rusqlite::Error),

    /// The query service was started without a usable artifacts directory.
    #[error("no index loaded: missing artifact {}", .0.display())]
    IndexMissing(PathBuf),

    /// A request field fell outside its declared range.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Bi-encoder or cross-encoder dispatch failed.
    #[error("model failure: {0}")]
    Model(String),

    /// Internal marker for a rerank deadline expiry; recovered in-pipeline.
    #[error("rerank exceeded its deadline")]
    RerankTimeout,
}

impl HermesError {
    /// True for errors a service boundary should report as a client error
    /// rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HermesError::Validation(_) | HermesError::IndexMissing(_)
        )
    }
}
