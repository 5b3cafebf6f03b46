// OpenAI-family adapter: pass-through translation with model-class parameter
// rewriting. Also serves OpenAI-compatible vendors, whose responses endpoint
// is bridged over chat.

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use crate::core::types::*;
use crate::llmclient::{HeaderFn, HttpClient};
use crate::providers::{guard_stream, responses_bridge, Provider, ProviderSettings, SseStream};
use futures::StreamExt;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use std::sync::Arc;

pub(crate) const PROVIDER_NAME: &str = "openai";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    http: HttpClient,
    native_responses: bool,
}

impl std::fmt::Debug for OpenAIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIProvider")
            .field("native_responses", &self.native_responses)
            .finish()
    }
}

impl OpenAIProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, Error> {
        Self::with_flavor(settings, true)
    }

    /// OpenAI-compatible vendor: same wire format, but `/responses` is served
    /// through the chat bridge. A base URL is mandatory since there is no
    /// sensible default host.
    pub fn compatible(settings: ProviderSettings) -> Result<Self, Error> {
        if settings.base_url.is_none() {
            return Err(Error::invalid_request(
                "openai-compatible providers require a base_url",
            ));
        }
        Self::with_flavor(settings, false)
    }

    fn with_flavor(settings: ProviderSettings, native_responses: bool) -> Result<Self, Error> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::invalid_request("openai api key must not be empty"));
        }

        let bearer = format!("Bearer {}", settings.api_key);
        let headers: HeaderFn = Arc::new(move |headers, ctx: &RequestContext| {
            if let Ok(value) = HeaderValue::from_str(&bearer) {
                headers.insert(AUTHORIZATION, value);
            }
            if let Some(id) = ctx.header_request_id() {
                if let Ok(value) = HeaderValue::from_str(id) {
                    headers.insert("x-request-id", value);
                }
            }
        });

        let base_url = settings
            .base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let mut http = HttpClient::new(PROVIDER_NAME, base_url, headers);
        if let Some(retry) = settings.retry {
            http = http.with_retry(retry);
        }
        if let Some(breaker) = settings.breaker {
            http = http.with_breaker(breaker);
        }
        if let Some(observer) = settings.observer {
            http = http.with_observer(observer);
        }

        Ok(Self {
            http,
            native_responses,
        })
    }

    /// Point the adapter at a different endpoint (fixture servers in tests).
    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.http.set_base_url(base_url);
    }

    /// Reasoning-class models: a single ascii 'o' followed by a decimal digit
    /// (o1, o3-mini, o4, ...). These take `max_completion_tokens` and reject
    /// custom temperatures.
    fn is_reasoning_model(model: &str) -> bool {
        let bytes = model.as_bytes();
        bytes.len() >= 2 && bytes[0] == b'o' && bytes[1].is_ascii_digit()
    }

    /// Serialize the normalized request, rewriting parameters for
    /// reasoning-class models. Everything else passes through unchanged.
    fn chat_body(req: &ChatRequest) -> Result<serde_json::Value, Error> {
        let mut body = serde_json::to_value(req)
            .map_err(|err| Error::invalid_request(format!("failed to encode chat request: {err}")))?;

        if Self::is_reasoning_model(&req.model) {
            if let serde_json::Value::Object(map) = &mut body {
                if let Some(max) = map.remove("max_tokens") {
                    map.insert("max_completion_tokens".to_string(), max);
                }
                map.remove("temperature");
            }
        }

        Ok(body)
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn chat(&self, ctx: &RequestContext, req: ChatRequest) -> Result<ChatResponse, Error> {
        let body = Self::chat_body(&req)?;
        self.http.post_json(ctx, "/chat/completions", &body).await
    }

    async fn chat_stream(&self, ctx: &RequestContext, req: ChatRequest) -> Result<SseStream, Error> {
        let mut req = req;
        req.stream = true;
        let body = Self::chat_body(&req)?;
        // the provider already speaks the chat-SSE dialect, pass bytes through
        let raw = self.http.stream(ctx, "/chat/completions", &body).await?;
        let mapped = raw.map(|item| item.map_err(Error::from));
        Ok(guard_stream(Box::pin(mapped), ctx))
    }

    async fn responses(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<ResponsesResponse, Error> {
        if self.native_responses {
            self.http.post_json(ctx, "/responses", &req).await
        } else {
            responses_bridge::responses_via_chat(self, ctx, req).await
        }
    }

    async fn responses_stream(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<SseStream, Error> {
        if self.native_responses {
            let mut req = req;
            req.stream = true;
            let raw = self.http.stream(ctx, "/responses", &req).await?;
            let mapped = raw.map(|item| item.map_err(Error::from));
            Ok(guard_stream(Box::pin(mapped), ctx))
        } else {
            let stream = responses_bridge::responses_stream_via_chat(self, ctx, req).await?;
            Ok(guard_stream(stream, ctx))
        }
    }

    async fn list_models(&self, ctx: &RequestContext) -> Result<ModelList, Error> {
        self.http.get_json(ctx, "/models").await
    }

    async fn embeddings(
        &self,
        ctx: &RequestContext,
        req: EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, Error> {
        self.http.post_json(ctx, "/embeddings", &req).await
    }
}
