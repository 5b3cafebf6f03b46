// Streaming translation: the provider's typed SSE events re-synthesized as
// the gateway's chat-SSE and responses-SSE dialects. Each converter is an
// explicit state machine over the incoming event stream; frames that cannot
// be handed out immediately wait in a pending queue.

use crate::core::error::Error;
use crate::core::types::*;
use crate::providers::anthropic::PROVIDER_NAME;
use crate::providers::sse;
use bytes::Bytes;
use eventsource_stream::{EventStream, Eventsource};
use futures::Stream;
use pin_project::pin_project;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use uuid::Uuid;

// ============================================================================
// Incoming event grammar
// ============================================================================

// Events are dispatched on the payload's own `type` tag; the SSE `event:`
// line is not consulted.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: StartedMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {},
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: BlockDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {},
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "ping")]
    Ping {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartedMessage {
    id: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: u32,
}

// ============================================================================
// Chat dialect converter
// ============================================================================

/// Translates the provider's event stream into chat-SSE chunk frames.
/// Single reader; input order is preserved; the final frame is always the
/// `[DONE]` terminator.
#[pin_project]
pub struct AnthropicChatStream<S> {
    #[pin]
    inner: EventStream<S>,
    model: String,
    message_id: Option<String>,
    fallback_id: String,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl<S, B, E> AnthropicChatStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    pub fn new(body: S, model: impl Into<String>) -> Self {
        Self {
            inner: body.eventsource(),
            model: model.into(),
            message_id: None,
            fallback_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for AnthropicChatStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.pending.push_back(sse::done_frame());
                    *this.done = true;
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(Error::provider(
                        PROVIDER_NAME,
                        502,
                        format!("stream read failed: {err}"),
                    ))));
                }
                Poll::Ready(Some(Ok(event))) => {
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    let parsed: ProviderEvent = match serde_json::from_str(&event.data) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            log::warn!("dropping malformed stream line: {err}");
                            continue;
                        }
                    };
                    match parsed {
                        ProviderEvent::MessageStart { message } => {
                            *this.message_id = Some(message.id);
                            if let Some(model) = message.model {
                                *this.model = model;
                            }
                        }
                        ProviderEvent::ContentBlockDelta {
                            delta: BlockDelta::TextDelta { text },
                        } => {
                            let id = this
                                .message_id
                                .as_deref()
                                .unwrap_or(this.fallback_id.as_str());
                            let chunk =
                                ChatChunk::content(id, this.model.as_str(), PROVIDER_NAME, text);
                            if let Some(frame) = sse::data_frame(&chunk) {
                                this.pending.push_back(frame);
                            }
                        }
                        ProviderEvent::MessageDelta { delta, usage } => {
                            if delta.stop_reason.is_some() || usage.is_some() {
                                let mapped = usage.map(|u| {
                                    Usage::new(u.input_tokens.unwrap_or(0), u.output_tokens)
                                });
                                let finish = delta
                                    .stop_reason
                                    .unwrap_or_else(|| "stop".to_string());
                                let id = this
                                    .message_id
                                    .as_deref()
                                    .unwrap_or(this.fallback_id.as_str());
                                let chunk = ChatChunk::finish(
                                    id,
                                    this.model.as_str(),
                                    PROVIDER_NAME,
                                    finish,
                                    mapped,
                                );
                                if let Some(frame) = sse::data_frame(&chunk) {
                                    this.pending.push_back(frame);
                                }
                            }
                        }
                        // start/stop markers and pings carry nothing for us
                        ProviderEvent::ContentBlockStart {}
                        | ProviderEvent::ContentBlockStop {}
                        | ProviderEvent::MessageStop {}
                        | ProviderEvent::Ping {}
                        | ProviderEvent::ContentBlockDelta { .. }
                        | ProviderEvent::Other => {}
                    }
                }
            }
        }
    }
}

// ============================================================================
// Responses dialect converter
// ============================================================================

/// Same input grammar, different output: typed `response.*` events with a
/// stable generated response id. Usage from `message_delta` is held back and
/// attached to the terminal `response.completed` event.
#[pin_project]
pub struct AnthropicResponsesStream<S> {
    #[pin]
    inner: EventStream<S>,
    model: String,
    response_id: String,
    usage: Option<ResponsesUsage>,
    created_sent: bool,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl<S, B, E> AnthropicResponsesStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    pub fn new(body: S, model: impl Into<String>) -> Self {
        Self {
            inner: body.eventsource(),
            model: model.into(),
            response_id: format!("resp_{}", Uuid::new_v4().simple()),
            usage: None,
            created_sent: false,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for AnthropicResponsesStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    if !*this.created_sent {
                        if let Some(frame) =
                            sse::response_created_frame(this.response_id, this.model)
                        {
                            this.pending.push_back(frame);
                        }
                        *this.created_sent = true;
                    }
                    if let Some(frame) = sse::response_completed_frame(
                        this.response_id,
                        this.model,
                        this.usage.take(),
                    ) {
                        this.pending.push_back(frame);
                    }
                    this.pending.push_back(sse::done_frame());
                    *this.done = true;
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(Error::provider(
                        PROVIDER_NAME,
                        502,
                        format!("stream read failed: {err}"),
                    ))));
                }
                Poll::Ready(Some(Ok(event))) => {
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    let parsed: ProviderEvent = match serde_json::from_str(&event.data) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            log::warn!("dropping malformed stream line: {err}");
                            continue;
                        }
                    };
                    match parsed {
                        ProviderEvent::MessageStart { message } => {
                            if let Some(model) = message.model {
                                *this.model = model;
                            }
                            if !*this.created_sent {
                                if let Some(frame) =
                                    sse::response_created_frame(this.response_id, this.model)
                                {
                                    this.pending.push_back(frame);
                                }
                                *this.created_sent = true;
                            }
                        }
                        ProviderEvent::ContentBlockDelta {
                            delta: BlockDelta::TextDelta { text },
                        } => {
                            if !*this.created_sent {
                                if let Some(frame) =
                                    sse::response_created_frame(this.response_id, this.model)
                                {
                                    this.pending.push_back(frame);
                                }
                                *this.created_sent = true;
                            }
                            if let Some(frame) = sse::output_text_delta_frame(&text) {
                                this.pending.push_back(frame);
                            }
                        }
                        ProviderEvent::MessageDelta { usage, .. } => {
                            if let Some(u) = usage {
                                *this.usage = Some(ResponsesUsage::new(
                                    u.input_tokens.unwrap_or(0),
                                    u.output_tokens,
                                ));
                            }
                        }
                        ProviderEvent::ContentBlockStart {}
                        | ProviderEvent::ContentBlockStop {}
                        | ProviderEvent::MessageStop {}
                        | ProviderEvent::Ping {}
                        | ProviderEvent::ContentBlockDelta { .. }
                        | ProviderEvent::Other => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::convert::Infallible;

    fn byte_stream(parts: Vec<&str>) -> impl Stream<Item = Result<Bytes, Infallible>> {
        futures::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from(p.to_string())))
                .collect::<Vec<_>>(),
        )
    }

    const TRANSCRIPT: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet-20241022\"}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"He\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"llo\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    async fn collect_frames<S>(stream: S) -> Vec<String>
    where
        S: Stream<Item = Result<Bytes, Error>>,
    {
        stream
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    fn chunk_json(frame: &str) -> serde_json::Value {
        let data = frame.trim_end().strip_prefix("data: ").unwrap();
        serde_json::from_str(data).unwrap()
    }

    #[tokio::test]
    async fn test_chat_stream_translation() {
        let stream = AnthropicChatStream::new(byte_stream(vec![TRANSCRIPT]), "m");
        let frames = collect_frames(stream).await;
        assert_eq!(frames.len(), 4);

        let first = chunk_json(&frames[0]);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["id"], "msg_1");
        assert_eq!(first["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(first["provider"], "anthropic");
        assert_eq!(first["choices"][0]["delta"]["content"], "He");
        assert!(first["choices"][0]["finish_reason"].is_null());

        let second = chunk_json(&frames[1]);
        assert_eq!(second["choices"][0]["delta"]["content"], "llo");

        let finish = chunk_json(&frames[2]);
        assert!(finish["choices"][0]["delta"].as_object().unwrap().is_empty());
        assert_eq!(finish["choices"][0]["finish_reason"], "end_turn");
        assert_eq!(finish["usage"]["completion_tokens"], 2);

        assert_eq!(frames[3], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_chat_stream_survives_split_reads() {
        // the same transcript delivered in awkward byte fragments
        let mid = TRANSCRIPT.len() / 2 + 3;
        let stream = AnthropicChatStream::new(
            byte_stream(vec![&TRANSCRIPT[..mid], &TRANSCRIPT[mid..]]),
            "m",
        );
        let frames = collect_frames(stream).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_chat_stream_drops_malformed_lines() {
        let transcript = "data: {not json}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n";
        let stream = AnthropicChatStream::new(byte_stream(vec![transcript]), "m");
        let frames = collect_frames(stream).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(chunk_json(&frames[0])["choices"][0]["delta"]["content"], "ok");
        assert_eq!(frames[1], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_chat_stream_done_emitted_exactly_once() {
        let stream = AnthropicChatStream::new(byte_stream(vec![TRANSCRIPT]), "m");
        let frames = collect_frames(stream).await;
        let done_count = frames.iter().filter(|f| f.contains("[DONE]")).count();
        assert_eq!(done_count, 1);
        assert!(frames.last().unwrap().contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_responses_stream_translation() {
        let stream = AnthropicResponsesStream::new(byte_stream(vec![TRANSCRIPT]), "m");
        let frames = collect_frames(stream).await;
        assert_eq!(frames.len(), 5);

        assert!(frames[0].starts_with("event: response.created\n"));
        let created = event_json(&frames[0]);
        assert_eq!(created["response"]["status"], "in_progress");
        let rid = created["response"]["id"].as_str().unwrap().to_string();
        assert!(rid.starts_with("resp_"));

        assert!(frames[1].starts_with("event: response.output_text.delta\n"));
        assert_eq!(event_json(&frames[1])["delta"], "He");
        assert_eq!(event_json(&frames[2])["delta"], "llo");

        assert!(frames[3].starts_with("event: response.completed\n"));
        let completed = event_json(&frames[3]);
        assert_eq!(completed["response"]["id"], rid.as_str());
        assert_eq!(completed["response"]["status"], "completed");
        assert_eq!(completed["response"]["usage"]["output_tokens"], 2);

        assert_eq!(frames[4], "data: [DONE]\n\n");
    }

    fn event_json(frame: &str) -> serde_json::Value {
        let data = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        serde_json::from_str(data).unwrap()
    }

    #[tokio::test]
    async fn test_responses_stream_empty_input_still_completes() {
        let stream = AnthropicResponsesStream::new(byte_stream(vec![""]), "m");
        let frames = collect_frames(stream).await;
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("event: response.created\n"));
        assert!(frames[1].starts_with("event: response.completed\n"));
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }
}
