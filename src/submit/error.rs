//! Submission error types.

use thiserror::Error;

/// Errors that can occur while delivering a batch to the backend.
///
/// The delivery worker logs these and moves on; a failed batch is never
/// retried.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Transport-level failure (connect, TLS, timeout).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend rejected batch with status {0}")]
    Status(u16),

    /// The batch could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Anything else a client wants to report.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message() {
        assert_eq!(
            SubmissionError::Status(503).to_string(),
            "backend rejected batch with status 503"
        );
    }
}
