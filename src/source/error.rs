use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timed out fetching {0}")]
    Timeout(String),

    #[error("Rate limited: retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("No versions published for {0}")]
    NoVersions(String),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Integrity violation for {name}@{version}: expected {expected}, got {actual}")]
    IntegrityViolation {
        name: String,
        version: String,
        expected: String,
        actual: String,
    },

    #[error("No tag found for {name}@{version}")]
    RefNotFound { name: String, version: String },

    #[error("Git error: {0}")]
    Git(String),

    #[error("No source available for {0}")]
    UnsupportedSource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::RateLimited { .. } => true,
            FetchError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            FetchError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map a transport error, classifying client-side timeouts
    pub fn from_transport(e: reqwest::Error, what: &str) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(what.to_string())
        } else {
            FetchError::Network(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FetchError::Timeout("a".into()), true)]
    #[case(FetchError::RateLimited { retry_after_secs: Some(1) }, true)]
    #[case(FetchError::UnexpectedStatus { status: 503, url: "u".into() }, true)]
    #[case(FetchError::UnexpectedStatus { status: 400, url: "u".into() }, false)]
    #[case(FetchError::NotFound("a".into()), false)]
    #[case(FetchError::Cancelled, false)]
    #[case(FetchError::IntegrityViolation {
        name: "a".into(),
        version: "1.0.0".into(),
        expected: "sha256-00".into(),
        actual: "sha256-11".into(),
    }, false)]
    fn is_retryable_classifies_errors(#[case] error: FetchError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }
}
