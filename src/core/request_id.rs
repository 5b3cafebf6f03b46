// Request-scoped context: caller request-id, cancellation, deadlines

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Providers only accept well-behaved request ids.
const MAX_REQUEST_ID_BYTES: usize = 512;

/// Per-call context threaded through every adapter operation. Carries the
/// caller's request identifier (propagated into outbound headers under each
/// provider's preferred name), the cancellation token, and timing limits.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    request_id: Option<String>,
    cancel: CancellationToken,
    attempt_timeout: Option<Duration>,
    deadline: Option<tokio::time::Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Timeout applied to each individual HTTP attempt.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Overall deadline for the call. Retries never extend it.
    pub fn with_deadline(mut self, from_now: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + from_now);
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Request id suitable for an outbound header: ASCII only, at most 512
    /// bytes. Anything else is withheld from the provider.
    pub fn header_request_id(&self) -> Option<&str> {
        self.request_id
            .as_deref()
            .filter(|id| id.is_ascii() && id.len() <= MAX_REQUEST_ID_BYTES && !id.is_empty())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// True once the overall deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|d| tokio::time::Instant::now() >= d)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_request_id_passes_ascii() {
        let ctx = RequestContext::new().with_request_id("req-abc-123");
        assert_eq!(ctx.header_request_id(), Some("req-abc-123"));
    }

    #[test]
    fn test_header_request_id_rejects_non_ascii() {
        let ctx = RequestContext::new().with_request_id("réq-1");
        assert_eq!(ctx.header_request_id(), None);
        assert_eq!(ctx.request_id(), Some("réq-1"));
    }

    #[test]
    fn test_header_request_id_rejects_oversize() {
        let ctx = RequestContext::new().with_request_id("x".repeat(513));
        assert_eq!(ctx.header_request_id(), None);

        let ctx = RequestContext::new().with_request_id("x".repeat(512));
        assert!(ctx.header_request_id().is_some());
    }

    #[test]
    fn test_cancellation_defaults_inactive() {
        let ctx = RequestContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
