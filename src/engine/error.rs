//! Error types for the upload engine

use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types. Transient failures feed the retry path; everything
/// else is fatal for the transfer.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// Upload was cancelled
    #[error("Upload cancelled")]
    Cancelled,

    /// Init handshake with the server failed
    #[error("Failed to initialize upload: {0}")]
    InitFailed(String),

    /// Failed to read the source file
    #[error("Failed to read source file: {0}")]
    FileRead(String),

    /// Connection reset, timeout, or a 5xx response
    #[error("Transient network failure: {0}")]
    Network(String),

    /// A 4xx response; retrying the same payload cannot succeed
    #[error("Server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A transient failure persisted past the retry budget
    #[error("Chunk {chunk_index} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        chunk_index: usize,
        attempts: u32,
        message: String,
    },

    /// The finalize call failed or the server reported a terminal error
    #[error("Finalize failed: {0}")]
    FinalizeFailed(String),
}

impl UploadError {
    /// Whether the retry-with-backoff path applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network(_))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Network(err.to_string())
    }
}
