//! Error types for the Koza sync client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),

    /// All login strategies exhausted. Fatal for the calling operation.
    #[error("Koza authentication failed: {0}")]
    Authentication(String),

    /// Branch selection could not be completed. Non-fatal: callers proceed
    /// and let operation-level retries repair the session.
    #[error("Koza branch selection failed: {0}")]
    BranchSelection(String),

    /// Connection resets / timeouts that survived the retry schedule.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Warm-up listing produced no usable code→id pairs; the sync is aborted
    /// rather than risk mass duplicate creation from an empty cache.
    #[error("cache integrity failure: {0}")]
    CacheIntegrity(String),

    /// Non-zero backend error code that is not a duplicate. Reported, not retried.
    #[error("Koza rejected request: {0}")]
    Rejected(String),

    /// Katana inventory API error with status and body preserved.
    #[error("Katana API error (status {status}): {body}")]
    Inventory { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;
