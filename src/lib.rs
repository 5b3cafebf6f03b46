pub mod core;
pub mod llmclient;
pub mod providers;

// Re-export commonly used items for convenience
pub use crate::core::error::Error;
pub use crate::core::request_id::RequestContext;
pub use crate::core::types::*;
pub use llmclient::{BreakerPolicy, HttpClient, RetryPolicy};
pub use providers::{create_provider, provider_types, Provider, ProviderSettings, SseStream};
