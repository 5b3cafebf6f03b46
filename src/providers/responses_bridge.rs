// Responses-over-chat bridge for providers without a native responses
// endpoint: request/response conversion plus a streaming upgrade that
// re-emits chat chunks as responses-SSE events.

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use crate::core::types::*;
use crate::providers::sse;
use crate::providers::{Provider, SseStream};
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use uuid::Uuid;

/// Lower a responses-request into a chat-request: instructions become a
/// leading system message, string input a single user message, and structured
/// input is flattened to text per item.
pub fn responses_to_chat(req: &ResponsesRequest) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(instructions) = &req.instructions {
        messages.push(ChatMessage::new(Role::System, instructions.clone()));
    }

    match &req.input {
        ResponsesInput::Text(text) => {
            messages.push(ChatMessage::new(Role::User, text.clone()));
        }
        ResponsesInput::Items(items) => {
            for item in items {
                let role = match item.role.as_str() {
                    "system" => Role::System,
                    "assistant" => Role::Assistant,
                    "tool" => Role::Tool,
                    _ => Role::User,
                };
                messages.push(ChatMessage::new(role, item.content.flatten_text()));
            }
        }
    }

    ChatRequest {
        model: req.model.clone(),
        messages,
        temperature: req.temperature,
        max_tokens: req.max_output_tokens,
        reasoning: req.reasoning.clone(),
        stream: req.stream,
        stream_options: None,
        provider: None,
        tools: None,
    }
}

/// Lift a chat-response back into the responses shape with a synthesized
/// message id and completed status.
pub fn chat_to_responses(resp: &ChatResponse) -> ResponsesResponse {
    let text = resp
        .choices
        .first()
        .map(|c| c.message.content.clone())
        .unwrap_or_default();
    let usage = resp
        .usage
        .as_ref()
        .map(|u| ResponsesUsage::new(u.prompt_tokens, u.completion_tokens));

    ResponsesResponse {
        id: format!("resp_{}", Uuid::new_v4().simple()),
        object: OBJECT_RESPONSE.to_string(),
        created_at: resp.created,
        model: resp.model.clone(),
        status: STATUS_COMPLETED.to_string(),
        output: vec![OutputItem {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            status: STATUS_COMPLETED.to_string(),
            content: vec![OutputContent {
                kind: "output_text".to_string(),
                text,
                annotations: Vec::new(),
            }],
        }],
        usage,
    }
}

pub async fn responses_via_chat<P>(
    provider: &P,
    ctx: &RequestContext,
    req: ResponsesRequest,
) -> Result<ResponsesResponse, Error>
where
    P: Provider + ?Sized,
{
    let mut chat_req = responses_to_chat(&req);
    chat_req.stream = false;
    let chat_resp = provider.chat(ctx, chat_req).await?;
    Ok(chat_to_responses(&chat_resp))
}

pub async fn responses_stream_via_chat<P>(
    provider: &P,
    ctx: &RequestContext,
    req: ResponsesRequest,
) -> Result<SseStream, Error>
where
    P: Provider + ?Sized,
{
    let model = req.model.clone();
    let mut chat_req = responses_to_chat(&req);
    chat_req.stream = true;
    let chat_stream = provider.chat_stream(ctx, chat_req).await?;
    Ok(upgrade_chat_stream(chat_stream, model))
}

/// Re-emit a chat-SSE byte stream as responses-SSE events:
/// `response.created` at the first chunk, every content delta as
/// `response.output_text.delta`, then `response.completed` + `[DONE]`.
pub fn upgrade_chat_stream<S>(chat_stream: S, model: String) -> SseStream
where
    S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let response_id = format!("resp_{}", Uuid::new_v4().simple());
        let mut created_sent = false;
        let mut usage: Option<ResponsesUsage> = None;

        let events = chat_stream.eventsource();
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data == "[DONE]" {
                        break;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    let chunk: ChatChunk = match serde_json::from_str(data) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            log::warn!("dropping malformed chat chunk: {err}");
                            continue;
                        }
                    };

                    if !created_sent {
                        if let Some(frame) = sse::response_created_frame(&response_id, &model) {
                            yield Ok(frame);
                        }
                        created_sent = true;
                    }
                    if let Some(u) = &chunk.usage {
                        usage = Some(ResponsesUsage::new(u.prompt_tokens, u.completion_tokens));
                    }
                    for choice in &chunk.choices {
                        if let Some(text) = choice.delta.content.as_deref() {
                            if text.is_empty() {
                                continue;
                            }
                            if let Some(frame) = sse::output_text_delta_frame(text) {
                                yield Ok(frame);
                            }
                        }
                    }
                }
                Err(EventStreamError::Transport(err)) => {
                    yield Err(err);
                    return;
                }
                Err(other) => {
                    log::warn!("dropping malformed chat stream data: {other}");
                }
            }
        }

        if !created_sent {
            if let Some(frame) = sse::response_created_frame(&response_id, &model) {
                yield Ok(frame);
            }
        }
        if let Some(frame) = sse::response_completed_frame(&response_id, &model, usage) {
            yield Ok(frame);
        }
        yield Ok(sse::done_frame());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn responses_request(input: ResponsesInput) -> ResponsesRequest {
        ResponsesRequest {
            model: "gpt-4o".to_string(),
            input,
            instructions: None,
            temperature: None,
            max_output_tokens: None,
            reasoning: None,
            stream: false,
        }
    }

    #[test]
    fn test_instructions_become_leading_system_message() {
        let mut req = responses_request(ResponsesInput::Text("Hi".to_string()));
        req.instructions = Some("Be helpful".to_string());
        let chat = responses_to_chat(&req);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, Role::System);
        assert_eq!(chat.messages[0].content, "Be helpful");
        assert_eq!(chat.messages[1].role, Role::User);
        assert_eq!(chat.messages[1].content, "Hi");
    }

    #[test]
    fn test_structured_input_flattened_with_single_spaces() {
        let req = responses_request(ResponsesInput::Items(vec![InputItem {
            role: "user".to_string(),
            content: InputContent::Blocks(vec![
                InputBlock {
                    kind: Some("input_text".to_string()),
                    text: Some("part one".to_string()),
                },
                InputBlock {
                    kind: None,
                    text: None,
                },
                InputBlock {
                    kind: Some("input_text".to_string()),
                    text: Some("part two".to_string()),
                },
            ]),
        }]));
        let chat = responses_to_chat(&req);
        assert_eq!(chat.messages[0].content, "part one part two");
    }

    #[test]
    fn test_chat_to_responses_shape() {
        let chat = ChatResponse {
            id: "chatcmpl-1".to_string(),
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created: 1700000000,
            model: "gpt-4o".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, "Answer"),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage::new(4, 6)),
        };
        let resp = chat_to_responses(&chat);
        assert!(resp.id.starts_with("resp_"));
        assert_eq!(resp.status, "completed");
        assert_eq!(resp.output[0].kind, "message");
        assert_eq!(resp.output[0].role, "assistant");
        assert_eq!(resp.output[0].content[0].kind, "output_text");
        assert_eq!(resp.output[0].content[0].text, "Answer");
        let usage = resp.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens, usage.total_tokens), (4, 6, 10));
    }

    #[test]
    fn test_round_trip_preserves_messages_and_text() {
        let mut req = responses_request(ResponsesInput::Items(vec![
            InputItem {
                role: "user".to_string(),
                content: InputContent::Text("What is six times seven?".to_string()),
            },
        ]));
        req.instructions = Some("You are a calculator".to_string());

        let chat = responses_to_chat(&req);
        assert_eq!(
            chat.messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>(),
            vec!["You are a calculator", "What is six times seven?"]
        );

        let chat_resp = ChatResponse {
            id: "chatcmpl-1".to_string(),
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created: 1700000000,
            model: chat.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, "42"),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        };
        let resp = chat_to_responses(&chat_resp);
        assert_eq!(resp.output[0].content[0].text, "42");
    }

    fn chat_sse(frames: &[&str]) -> impl Stream<Item = Result<Bytes, Error>> {
        futures::stream::iter(
            frames
                .iter()
                .map(|f| Ok(Bytes::from(f.to_string())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_upgrade_chat_stream_event_order() {
        let input = [
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ];
        let upgraded = upgrade_chat_stream(chat_sse(&input), "m".to_string());
        let frames: Vec<String> = upgraded
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 5);
        assert!(frames[0].starts_with("event: response.created\n"));
        assert!(frames[1].starts_with("event: response.output_text.delta\n"));
        assert!(frames[2].starts_with("event: response.output_text.delta\n"));
        assert!(frames[3].starts_with("event: response.completed\n"));
        assert_eq!(frames[4], "data: [DONE]\n\n");

        let completed: serde_json::Value = serde_json::from_str(
            frames[3]
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(completed["response"]["usage"]["input_tokens"], 3);
        assert_eq!(completed["response"]["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn test_upgrade_chat_stream_empty_input() {
        let upgraded = upgrade_chat_stream(chat_sse(&[]), "m".to_string());
        let frames: Vec<String> = upgraded
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("event: response.created\n"));
        assert!(frames[1].starts_with("event: response.completed\n"));
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }
}
