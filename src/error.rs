//! Error types for forge-driver

use crate::types::Provider;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by drivers, the runner manager and merge automation
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration (token, repository URL, provider name)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No API root could be discovered for the repository
    #[error("could not resolve API base for {url}: {reason}")]
    Resolution {
        /// Repository URL that was probed
        url: String,
        /// First failure encountered while probing
        reason: String,
    },

    /// The provider rejected the credentials
    #[error("authentication failed (HTTP {status}): {message}")]
    Authentication {
        /// HTTP status code (401 or 403)
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Repository or resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider has no equivalent capability
    #[error("{provider} does not support {operation}")]
    Unsupported {
        /// Provider lacking the capability
        provider: Provider,
        /// Operation that was requested
        operation: &'static str,
    },

    /// Generic non-success response from the provider
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Runner registration failed; carries an operator hint
    #[error("failed to register runner: {source}\nhint: {hint}")]
    RunnerRegistration {
        /// Provider-specific guidance
        hint: &'static str,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Any failure while preparing a runner (download, registration, spawn)
    #[error("failed preparing {provider} runner: {source}")]
    RunnerSetup {
        /// Provider the runner was being prepared for
        provider: Provider,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Auto-merge could not be enabled and the immediate merge failed too
    #[error("auto-merge failed ({primary}); immediate merge also failed: {fallback}")]
    AutoMergeFallback {
        /// Last failure of the gated auto-merge request
        primary: Box<Error>,
        /// Failure of the unconditional merge
        fallback: Box<Error>,
    },

    /// A PR/MR was opened but auto-merge could not be engaged on it
    #[error("pull request {url} was opened but auto-merge failed: {source}")]
    PullRequestAutoMerge {
        /// Web URL of the opened PR/MR
        url: String,
        /// Auto-merge failure
        #[source]
        source: Box<Error>,
    },

    /// Filesystem or process failure
    #[error("{context}: {source}")]
    Resource {
        /// What was being done
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded
    #[error("failed to decode response: {0}")]
    Json(#[from] serde_json::Error),

    /// URL could not be parsed or built
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Build an `Unsupported` error
    pub const fn unsupported(provider: Provider, operation: &'static str) -> Self {
        Self::Unsupported {
            provider,
            operation,
        }
    }

    /// Wrap an I/O error with context
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// Map a failed HTTP status to the matching variant
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Authentication { status, message },
            404 => Self::NotFound(message),
            _ => Self::Api { status, message },
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// URL of a PR/MR that exists despite this error
    pub fn pull_request_url(&self) -> Option<&str> {
        match self {
            Self::PullRequestAutoMerge { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Whether this is an `Unsupported` error
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            Error::from_status(401, String::new()),
            Error::Authentication { status: 401, .. }
        ));
        assert!(matches!(
            Error::from_status(403, String::new()),
            Error::Authentication { status: 403, .. }
        ));
        assert!(matches!(
            Error::from_status(404, "gone".into()),
            Error::NotFound(m) if m == "gone"
        ));
        assert!(matches!(
            Error::from_status(302, String::new()),
            Error::Api { status: 302, .. }
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::from_status(503, String::new()).is_transient());
        assert!(Error::from_status(429, String::new()).is_transient());
        assert!(!Error::from_status(405, String::new()).is_transient());
        assert!(!Error::from_status(401, String::new()).is_transient());
        assert!(!Error::unsupported(Provider::GitLab, "check runs").is_transient());
    }

    #[test]
    fn test_unsupported_message_names_provider() {
        let err = Error::unsupported(Provider::Bitbucket, "check runs");
        assert_eq!(err.to_string(), "Bitbucket does not support check runs");
        assert!(err.is_unsupported());
    }
}
