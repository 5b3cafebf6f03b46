// Error taxonomy shared by the transport and every adapter

/// Gateway error kinds. Circuit-open and parse failures surface as provider
/// errors with synthetic 503/502 statuses rather than dedicated variants, so
/// callers only ever match on four kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{provider} error (status {status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
        /// Provider's own error type tag, when the body carried one.
        error_type: Option<String>,
        /// Snippet of the original body for diagnostics.
        body: Option<String>,
    },

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub fn provider(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            status,
            message: message.into(),
            error_type: None,
            body: None,
        }
    }

    /// Fail-fast error while the circuit breaker is open.
    pub fn circuit_open(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Error::Provider {
            message: format!("{provider} circuit breaker is open"),
            provider,
            status: 503,
            error_type: Some("circuit_open".to_string()),
            body: None,
        }
    }

    /// Malformed wire response despite a 2xx status.
    pub fn parse(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            status: 502,
            message: format!("failed to decode provider response: {}", detail.into()),
            error_type: Some("parse_error".to_string()),
            body: None,
        }
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_is_provider_503() {
        let err = Error::circuit_open("anthropic");
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("circuit breaker"));
    }

    #[test]
    fn test_parse_is_provider_502() {
        let err = Error::parse("openai", "unexpected end of input");
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn test_invalid_request_has_no_status() {
        assert_eq!(Error::invalid_request("bad url").status(), None);
    }
}
