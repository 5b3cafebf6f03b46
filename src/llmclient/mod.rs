// HTTP transport shared by all adapters
// Wraps reqwest with retry, circuit breaking, header injection, and
// normalized error classification

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerPolicy, CircuitBreaker};
pub use retry::RetryPolicy;

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

/// Callback each adapter supplies to stamp auth, API-version, and request-id
/// headers onto every outbound request.
pub type HeaderFn = Arc<dyn Fn(&mut HeaderMap, &RequestContext) + Send + Sync>;

/// Observation hook invoked after every outbound attempt.
pub type ObserverFn = Arc<dyn Fn(&RequestEvent<'_>) + Send + Sync>;

/// What an observer sees per attempt. `status` is absent when the attempt
/// failed before a response arrived.
#[derive(Debug)]
pub struct RequestEvent<'a> {
    pub provider: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub attempt: u32,
    pub status: Option<u16>,
}

/// Still-open provider response body, for the stream converters.
pub type RawBody = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

pub struct HttpClient {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    headers: HeaderFn,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    observer: Option<ObserverFn>,
}

impl HttpClient {
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>, headers: HeaderFn) -> Self {
        let base_url = base_url.into();
        Self {
            client: reqwest::Client::new(),
            provider: provider.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            retry: RetryPolicy::disabled(),
            breaker: CircuitBreaker::new(BreakerPolicy::disabled()),
            observer: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_breaker(mut self, policy: BreakerPolicy) -> Self {
        self.breaker = CircuitBreaker::new(policy);
        self
    }

    pub fn with_observer(mut self, observer: ObserverFn) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Point the client at a different base URL. Used by tests to swap in a
    /// local fixture server.
    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// POST a JSON body and decode the 2xx response.
    pub async fn post_json<B, T>(&self, ctx: &RequestContext, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = encode_body(body)?;
        let response = self.send(ctx, Method::POST, path, Some(payload)).await?;
        self.decode(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, ctx: &RequestContext, path: &str) -> Result<T, Error> {
        let response = self.send(ctx, Method::GET, path, None).await?;
        self.decode(response).await
    }

    /// POST without a body (provider lifecycle endpoints).
    pub async fn post_empty<T: DeserializeOwned>(&self, ctx: &RequestContext, path: &str) -> Result<T, Error> {
        let response = self.send(ctx, Method::POST, path, None).await?;
        self.decode(response).await
    }

    /// POST a JSON body and hand back the still-open response body on 2xx.
    /// Non-2xx responses are classified and drained here. Once bytes start
    /// flowing the call is never retried.
    pub async fn stream<B>(&self, ctx: &RequestContext, path: &str, body: &B) -> Result<RawBody, Error>
    where
        B: Serialize + ?Sized,
    {
        let payload = encode_body(body)?;
        let response = self.send(ctx, Method::POST, path, Some(payload)).await?;
        Ok(Box::pin(response.bytes_stream()))
    }

    /// Fetch a whole body as bytes, for line-framed formats the caller parses
    /// itself.
    pub async fn fetch_bytes(&self, ctx: &RequestContext, method: Method, path: &str) -> Result<Bytes, Error> {
        let response = self.send(ctx, method, path, None).await?;
        response.bytes().await.map_err(Error::from)
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, Error> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.breaker.try_acquire() {
            return Err(Error::circuit_open(&self.provider));
        }

        let attempts = self.retry.attempts();
        let mut attempt: u32 = 0;
        loop {
            if ctx.deadline_exceeded() {
                self.breaker.record_failure();
                return Err(Error::provider(&self.provider, 504, "overall deadline exceeded"));
            }

            let outcome = self.execute_once(ctx, method.clone(), path, body.as_deref()).await;
            self.observe(&method, path, attempt, &outcome);
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success();
                        return Ok(response);
                    }
                    if attempt + 1 < attempts && retry::is_retryable_status(status.as_u16()) {
                        log::warn!(
                            "{} returned {}, retrying (attempt {}/{})",
                            self.provider,
                            status,
                            attempt + 1,
                            attempts
                        );
                        self.sleep_before_retry(ctx, attempt).await?;
                        attempt += 1;
                        continue;
                    }
                    self.breaker.record_failure();
                    return Err(self.classify_response(response).await);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    if attempt + 1 < attempts && matches!(err, Error::Transport(_)) {
                        log::warn!(
                            "{} request failed ({}), retrying (attempt {}/{})",
                            self.provider,
                            err,
                            attempt + 1,
                            attempts
                        );
                        self.sleep_before_retry(ctx, attempt).await?;
                        attempt += 1;
                        continue;
                    }
                    self.breaker.record_failure();
                    return Err(err);
                }
            }
        }
    }

    fn observe(
        &self,
        method: &Method,
        path: &str,
        attempt: u32,
        outcome: &Result<reqwest::Response, Error>,
    ) {
        if let Some(observer) = &self.observer {
            observer(&RequestEvent {
                provider: &self.provider,
                method: method.as_str(),
                path,
                attempt,
                status: outcome.as_ref().ok().map(|r| r.status().as_u16()),
            });
        }
    }

    async fn execute_once(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response, Error> {
        let url = format!("{}{}", self.base_url, path);
        let mut headers = HeaderMap::new();
        (self.headers)(&mut headers, ctx);

        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(timeout) = ctx.attempt_timeout() {
            request = request.timeout(timeout);
        }
        if let Some(bytes) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.to_vec());
        }

        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            result = request.send() => result.map_err(Error::from),
        }
    }

    async fn sleep_before_retry(&self, ctx: &RequestContext, attempt: u32) -> Result<(), Error> {
        let delay = self.retry.delay_for(attempt);
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, Error> {
        let bytes = response.bytes().await.map_err(Error::from)?;
        serde_json::from_slice(&bytes).map_err(|err| Error::parse(&self.provider, err.to_string()))
    }

    async fn classify_response(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        classify_error_body(&self.provider, status, &body)
    }
}

fn encode_body<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(body)
        .map_err(|err| Error::invalid_request(format!("failed to encode request body: {err}")))
}

/// Parse a provider's non-2xx body into a normalized provider error. Handles
/// both the `{error:{type, message}}` envelope and flat `{type, message}`
/// bodies; anything unparseable keeps a snippet for diagnostics.
pub(crate) fn classify_error_body(provider: &str, status: u16, body: &[u8]) -> Error {
    #[derive(serde::Deserialize)]
    struct Detail {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    #[derive(serde::Deserialize)]
    struct Envelope {
        #[serde(default)]
        error: Option<Detail>,
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    let snippet = String::from_utf8_lossy(&body[..body.len().min(256)]).into_owned();
    let (error_type, message) = match serde_json::from_slice::<Envelope>(body) {
        Ok(envelope) => {
            let detail_kind = envelope.error.as_ref().and_then(|d| d.kind.clone());
            let detail_message = envelope.error.and_then(|d| d.message);
            (
                detail_kind.or(envelope.kind),
                detail_message.or(envelope.message),
            )
        }
        Err(_) => (None, None),
    };

    Error::Provider {
        provider: provider.to_string(),
        status,
        message: message.unwrap_or_else(|| format!("request failed with status {status}")),
        error_type,
        body: if snippet.is_empty() { None } else { Some(snippet) },
    }
}
