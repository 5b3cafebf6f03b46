// Distinct-protocol adapter: full bidirectional translation between the
// normalized vocabulary and an Anthropic-style Messages API. System prompts
// live in a top-level field, responses are typed content blocks, usage has
// its own field names, and streaming is typed SSE events.

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use crate::core::types::*;
use crate::llmclient::{HeaderFn, HttpClient};
use crate::providers::anthropic_stream::{AnthropicChatStream, AnthropicResponsesStream};
use crate::providers::{guard_stream, responses_bridge, Provider, ProviderSettings, SseStream};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The provider rejects requests without max_tokens, so omitted values get a
/// conservative default.
const DEFAULT_MAX_TOKENS: u32 = 4096;

// Thinking budgets per effort level, and the headroom added on top of the
// budget when the caller's max_tokens would not cover it.
const BUDGET_LOW: u32 = 5_000;
const BUDGET_MEDIUM: u32 = 10_000;
const BUDGET_HIGH: u32 = 20_000;
const BUDGET_HEADROOM: u32 = 1_024;

/// Model families that take an effort knob directly instead of a numeric
/// thinking budget.
const ADAPTIVE_MODEL_PREFIXES: &[&str] = &["claude-opus-4-5", "claude-sonnet-4-5"];

pub struct AnthropicProvider {
    pub(crate) http: HttpClient,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider").finish()
    }
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, Error> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::invalid_request("anthropic api key must not be empty"));
        }

        let api_key = settings.api_key.clone();
        let headers: HeaderFn = Arc::new(move |headers, ctx: &RequestContext| {
            if let Ok(value) = HeaderValue::from_str(&api_key) {
                headers.insert("x-api-key", value);
            }
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
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

        Ok(Self { http })
    }

    /// Point the adapter at a different endpoint (fixture servers in tests).
    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.http.set_base_url(base_url);
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn chat(&self, ctx: &RequestContext, req: ChatRequest) -> Result<ChatResponse, Error> {
        let model = req.model.clone();
        let wire = build_messages_request(&req, false)?;
        let response: MessagesResponse = self.http.post_json(ctx, "/messages", &wire).await?;
        Ok(convert_messages_response(response, &model))
    }

    async fn chat_stream(&self, ctx: &RequestContext, req: ChatRequest) -> Result<SseStream, Error> {
        let model = req.model.clone();
        let wire = build_messages_request(&req, true)?;
        let body = self.http.stream(ctx, "/messages", &wire).await?;
        let converted = Box::pin(AnthropicChatStream::new(body, model)) as SseStream;
        Ok(guard_stream(converted, ctx))
    }

    async fn responses(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<ResponsesResponse, Error> {
        responses_bridge::responses_via_chat(self, ctx, req).await
    }

    async fn responses_stream(
        &self,
        ctx: &RequestContext,
        req: ResponsesRequest,
    ) -> Result<SseStream, Error> {
        let model = req.model.clone();
        let chat = responses_bridge::responses_to_chat(&req);
        let wire = build_messages_request(&chat, true)?;
        let body = self.http.stream(ctx, "/messages", &wire).await?;
        let converted = Box::pin(AnthropicResponsesStream::new(body, model)) as SseStream;
        Ok(guard_stream(converted, ctx))
    }

    async fn list_models(&self, ctx: &RequestContext) -> Result<ModelList, Error> {
        let wire: WireModelList = self.http.get_json(ctx, "/models?limit=1000").await?;
        Ok(ModelList {
            object: "list".to_string(),
            data: wire
                .data
                .into_iter()
                .map(|m| Model {
                    created: parse_created_at(m.created_at.as_deref()),
                    id: m.id,
                    object: "model".to_string(),
                    owned_by: PROVIDER_NAME.to_string(),
                })
                .collect(),
        })
    }

    async fn embeddings(
        &self,
        ctx: &RequestContext,
        req: EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, Error> {
        let _ = (ctx, req);
        Err(Error::invalid_request(
            "anthropic does not offer an embeddings endpoint; configure an \
             openai-compatible provider for embeddings instead",
        ))
    }

    async fn create_batch(&self, ctx: &RequestContext, req: BatchRequest) -> Result<Batch, Error> {
        crate::providers::anthropic_batch::create(self, ctx, req).await
    }

    async fn get_batch(&self, ctx: &RequestContext, id: &str) -> Result<Batch, Error> {
        crate::providers::anthropic_batch::get(self, ctx, id).await
    }

    async fn list_batches(
        &self,
        ctx: &RequestContext,
        after: Option<&str>,
        limit: Option<u32>,
    ) -> Result<BatchList, Error> {
        crate::providers::anthropic_batch::list(self, ctx, after, limit).await
    }

    async fn cancel_batch(&self, ctx: &RequestContext, id: &str) -> Result<Batch, Error> {
        crate::providers::anthropic_batch::cancel(self, ctx, id).await
    }

    async fn batch_results(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> Result<Vec<BatchResultItem>, Error> {
        crate::providers::anthropic_batch::results(self, ctx, id).await
    }
}

// ============================================================================
// Request translation
// ============================================================================

/// Build the provider's wire request from a normalized chat request. System
/// messages collapse into the top-level `system` field (last writer wins);
/// everything else keeps its order.
pub(crate) fn build_messages_request(
    req: &ChatRequest,
    stream: bool,
) -> Result<MessagesRequest, Error> {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::System => system = Some(msg.content.clone()),
            Role::User => messages.push(WireMessage {
                role: "user".to_string(),
                content: WireContent::Text(msg.content.clone()),
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(WireMessage {
                        role: "assistant".to_string(),
                        content: WireContent::Blocks(blocks),
                    });
                }
            }
            Role::Tool => {
                // Tool results travel as user-side tool_result blocks
                match &msg.tool_call_id {
                    Some(id) => messages.push(WireMessage {
                        role: "user".to_string(),
                        content: WireContent::Blocks(vec![ContentBlock::ToolResult {
                            tool_use_id: id.clone(),
                            content: msg.content.clone(),
                            is_error: None,
                        }]),
                    }),
                    None => messages.push(WireMessage {
                        role: "user".to_string(),
                        content: WireContent::Text(msg.content.clone()),
                    }),
                }
            }
        }
    }

    let mut wire = MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        temperature: req.temperature,
        stream: if stream { Some(true) } else { None },
        thinking: None,
        output_config: None,
        tools: req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| WireTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t.function.parameters.clone(),
                })
                .collect()
        }),
    };

    if let Some(reasoning) = &req.reasoning {
        apply_reasoning_policy(&mut wire, &reasoning.effort);
    }

    Ok(wire)
}

fn normalize_effort(effort: &str) -> &'static str {
    match effort {
        "low" => "low",
        "medium" => "medium",
        "high" => "high",
        other => {
            log::warn!("unsupported reasoning effort '{other}', downgrading to low");
            "low"
        }
    }
}

fn budget_for_effort(effort: &str) -> u32 {
    match effort {
        "medium" => BUDGET_MEDIUM,
        "high" => BUDGET_HIGH,
        _ => BUDGET_LOW,
    }
}

pub(crate) fn is_adaptive_thinking_model(model: &str) -> bool {
    ADAPTIVE_MODEL_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

fn apply_reasoning_policy(wire: &mut MessagesRequest, effort: &str) {
    let effort = normalize_effort(effort);

    if is_adaptive_thinking_model(&wire.model) {
        wire.thinking = Some(ThinkingConfig::Adaptive);
        wire.output_config = Some(OutputConfig {
            effort: effort.to_string(),
        });
    } else {
        let budget = budget_for_effort(effort);
        if wire.max_tokens <= budget {
            let raised = budget + BUDGET_HEADROOM;
            log::warn!(
                "raising max_tokens {} -> {} to cover thinking budget {}",
                wire.max_tokens,
                raised,
                budget
            );
            wire.max_tokens = raised;
        }
        wire.thinking = Some(ThinkingConfig::Enabled {
            budget_tokens: budget,
        });
    }

    // Extended thinking only samples at the default temperature
    if let Some(t) = wire.temperature {
        if (t - 1.0).abs() > f64::EPSILON {
            log::warn!("dropping temperature {t}: extended thinking requires the default");
            wire.temperature = None;
        }
    }
}

// ============================================================================
// Response translation
// ============================================================================

/// Normalize a unary provider response. Extended-thinking responses interleave
/// an empty preamble text block, a thinking block, and the answer, so the text
/// comes from the last text block.
pub(crate) fn convert_messages_response(
    resp: MessagesResponse,
    fallback_model: &str,
) -> ChatResponse {
    let text = resp
        .content
        .iter()
        .rev()
        .find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default();

    let tool_calls: Vec<ToolCall> = resp
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: if input.is_null() {
                        "{}".to_string()
                    } else {
                        input.to_string()
                    },
                },
            }),
            _ => None,
        })
        .collect();

    let usage = convert_usage(&resp.usage);

    ChatResponse {
        id: resp.id,
        object: OBJECT_CHAT_COMPLETION.to_string(),
        created: unix_now(),
        model: resp.model.unwrap_or_else(|| fallback_model.to_string()),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: text,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: resp.stop_reason,
        }],
        usage: Some(usage),
    }
}

pub(crate) fn convert_usage(usage: &WireUsage) -> Usage {
    let mut out = Usage::new(usage.input_tokens, usage.output_tokens);
    if let Some(n) = usage.cache_creation_input_tokens.filter(|n| *n > 0) {
        out.raw
            .insert("cache_creation_input_tokens".to_string(), n.into());
    }
    if let Some(n) = usage.cache_read_input_tokens.filter(|n| *n > 0) {
        out.raw
            .insert("cache_read_input_tokens".to_string(), n.into());
    }
    out
}

fn parse_created_at(ts: Option<&str>) -> i64 {
    match ts.map(chrono::DateTime::parse_from_rfc3339) {
        Some(Ok(dt)) => dt.timestamp(),
        Some(Err(err)) => {
            log::debug!("unparseable model timestamp ({err}), substituting now");
            unix_now()
        }
        None => unix_now(),
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_config: Option<OutputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage {
    pub role: String,
    pub content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ThinkingConfig {
    #[serde(rename = "adaptive")]
    Adaptive,
    #[serde(rename = "enabled")]
    Enabled { budget_tokens: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OutputConfig {
    pub effort: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub usage: WireUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    created_at: Option<String>,
}
