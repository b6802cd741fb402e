use thiserror::Error;

/// Failure taxonomy for a single preview request.
///
/// Everything except [`PreviewError::CallerUnauthenticated`] concerns the upstream origin
/// and is rendered as an in-frame placeholder rather than an HTTP error status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreviewError {
    #[error("No connection configured for tenant {tenant_id}")]
    NoConnectionConfigured { tenant_id: String },

    #[error("No storefront credential configured for tenant {tenant_id}")]
    NoCredentialConfigured { tenant_id: String },

    #[error("Upstream rejected the preview credential (status {status})")]
    UpstreamUnauthorized { status: u16 },

    #[error("Upstream preview is not ready yet")]
    UpstreamNotReady,

    #[error("Upstream request timed out after {timeout_ms} ms")]
    UpstreamTimeout { timeout_ms: u64 },

    #[error("Upstream error: {message}")]
    UpstreamOtherError { status: Option<u16>, message: String },

    #[error("Caller is not authenticated")]
    CallerUnauthenticated,
}

impl PreviewError {
    /// Create a new UpstreamOtherError without a status code
    pub fn upstream_other(message: impl Into<String>) -> Self {
        Self::UpstreamOtherError {
            status: None,
            message: message.into(),
        }
    }

    /// Create a new UpstreamOtherError for a failed upstream status
    pub fn upstream_status(status: u16) -> Self {
        Self::UpstreamOtherError {
            status: Some(status),
            message: format!("upstream responded with status {status}"),
        }
    }

    /// Short machine-readable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoConnectionConfigured { .. } => "no_connection",
            Self::NoCredentialConfigured { .. } => "no_credential",
            Self::UpstreamUnauthorized { .. } => "upstream_unauthorized",
            Self::UpstreamNotReady => "upstream_not_ready",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamOtherError { .. } => "upstream_error",
            Self::CallerUnauthenticated => "caller_unauthenticated",
        }
    }
}

/// Errors raised by the external collaborator lookups (connection store, port registry).
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Connection lookup failed: {0}")]
    Lookup(String),

    #[error("Invalid origin domain '{domain}': {source}")]
    InvalidOrigin {
        domain: String,
        #[source]
        source: url::ParseError,
    },
}

pub type Result<T> = std::result::Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(PreviewError::CallerUnauthenticated.kind(), "caller_unauthenticated");
        assert_eq!(PreviewError::UpstreamNotReady.kind(), "upstream_not_ready");
        assert_eq!(PreviewError::upstream_status(502).kind(), "upstream_error");
        assert_eq!(
            PreviewError::UpstreamTimeout { timeout_ms: 25_000 }.kind(),
            "upstream_timeout"
        );
    }

    #[test]
    fn upstream_status_carries_code() {
        match PreviewError::upstream_status(503) {
            PreviewError::UpstreamOtherError { status, message } => {
                assert_eq!(status, Some(503));
                assert!(message.contains("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
