// Provider adapters: one implementation of the normalized interface per
// third-party API, created through a process-wide registry

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "anthropic")]
pub mod anthropic_batch;
#[cfg(feature = "anthropic")]
pub mod anthropic_stream;
#[cfg(feature = "openai")]
pub mod openai;
pub mod responses_bridge;
pub(crate) mod sse;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicProvider;
#[cfg(feature = "openai")]
pub use openai::OpenAIProvider;

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use crate::core::types::*;
use crate::llmclient::{BreakerPolicy, ObserverFn, RetryPolicy};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;

/// Already-translated SSE bytes, ready to forward to a gateway client.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Construction-time provider configuration.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: Option<String>,
    pub retry: Option<RetryPolicy>,
    pub breaker: Option<BreakerPolicy>,
    /// Hook invoked after every outbound attempt, for request/response
    /// observation.
    pub observer: Option<ObserverFn>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Unified interface every adapter implements. Operations a provider cannot
/// serve fail with an invalid-request error by default.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn chat(&self, ctx: &RequestContext, req: ChatRequest) -> Result<ChatResponse, Error>;

    async fn chat_stream(&self, ctx: &RequestContext, req: ChatRequest) -> Result<SseStream, Error>;

    async fn responses(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<ResponsesResponse, Error>;

    async fn responses_stream(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<SseStream, Error>;

    async fn list_models(&self, ctx: &RequestContext) -> Result<ModelList, Error>;

    async fn embeddings(
        &self,
        ctx: &RequestContext,
        req: EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, Error> {
        let _ = (ctx, req);
        Err(Error::invalid_request(format!(
            "provider '{}' does not support embeddings",
            self.name()
        )))
    }

    async fn create_batch(&self, ctx: &RequestContext, req: BatchRequest) -> Result<Batch, Error> {
        let _ = (ctx, req);
        Err(self.batch_unsupported())
    }

    async fn get_batch(&self, ctx: &RequestContext, id: &str) -> Result<Batch, Error> {
        let _ = (ctx, id);
        Err(self.batch_unsupported())
    }

    async fn list_batches(
        &self,
        ctx: &RequestContext,
        after: Option<&str>,
        limit: Option<u32>,
    ) -> Result<BatchList, Error> {
        let _ = (ctx, after, limit);
        Err(self.batch_unsupported())
    }

    async fn cancel_batch(&self, ctx: &RequestContext, id: &str) -> Result<Batch, Error> {
        let _ = (ctx, id);
        Err(self.batch_unsupported())
    }

    async fn batch_results(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> Result<Vec<BatchResultItem>, Error> {
        let _ = (ctx, id);
        Err(self.batch_unsupported())
    }

    #[doc(hidden)]
    fn batch_unsupported(&self) -> Error {
        Error::invalid_request(format!(
            "provider '{}' does not support batches",
            self.name()
        ))
    }
}

/// Abort an emitted stream as soon as the caller's token fires. The caller
/// observes a cancellation error on its next read.
pub(crate) fn guard_stream(stream: SseStream, ctx: &RequestContext) -> SseStream {
    let token = ctx.cancellation().clone();
    Box::pin(async_stream::stream! {
        let mut inner = stream;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    yield Err(Error::Cancelled);
                    break;
                }
                item = inner.next() => {
                    match item {
                        Some(item) => yield item,
                        None => break,
                    }
                }
            }
        }
    })
}

// ============================================================================
// Registry
// ============================================================================

pub type Factory = fn(ProviderSettings) -> Result<Arc<dyn Provider>, Error>;

static REGISTRY: OnceLock<HashMap<&'static str, Factory>> = OnceLock::new();

fn builtin_factories() -> HashMap<&'static str, Factory> {
    let mut factories: HashMap<&'static str, Factory> = HashMap::new();
    #[cfg(feature = "anthropic")]
    factories.insert("anthropic", |settings| {
        Ok(Arc::new(AnthropicProvider::new(settings)?) as Arc<dyn Provider>)
    });
    #[cfg(feature = "openai")]
    {
        factories.insert("openai", |settings| {
            Ok(Arc::new(OpenAIProvider::new(settings)?) as Arc<dyn Provider>)
        });
        factories.insert("openai-compatible", |settings| {
            Ok(Arc::new(OpenAIProvider::compatible(settings)?) as Arc<dyn Provider>)
        });
    }
    factories
}

/// Instantiate an adapter by provider-type tag. The registry is built once at
/// first use and read-only afterwards.
pub fn create_provider(tag: &str, settings: ProviderSettings) -> Result<Arc<dyn Provider>, Error> {
    let registry = REGISTRY.get_or_init(builtin_factories);
    match registry.get(tag) {
        Some(factory) => factory(settings),
        None => Err(Error::invalid_request(format!(
            "unknown provider type '{tag}'"
        ))),
    }
}

/// Tags available from the registry.
pub fn provider_types() -> Vec<&'static str> {
    let registry = REGISTRY.get_or_init(builtin_factories);
    let mut tags: Vec<&'static str> = registry.keys().copied().collect();
    tags.sort_unstable();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_builtin_tags() {
        let tags = provider_types();
        #[cfg(feature = "anthropic")]
        assert!(tags.contains(&"anthropic"));
        #[cfg(feature = "openai")]
        assert!(tags.contains(&"openai"));
    }

    #[test]
    fn test_unknown_tag_is_invalid_request() {
        let err = create_provider("yodel", ProviderSettings::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[cfg(feature = "anthropic")]
    #[test]
    fn test_factory_builds_adapter() {
        let provider = create_provider(
            "anthropic",
            ProviderSettings {
                api_key: "sk-test".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(provider.name(), "anthropic");
    }
}
