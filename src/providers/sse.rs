// Frame assembly for the two emitted SSE dialects

use crate::core::types::*;
use bytes::Bytes;
use serde::Serialize;

pub(crate) const EVENT_RESPONSE_CREATED: &str = "response.created";
pub(crate) const EVENT_OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
pub(crate) const EVENT_RESPONSE_COMPLETED: &str = "response.completed";

pub(crate) fn done_frame() -> Bytes {
    Bytes::from_static(SSE_DONE_FRAME)
}

/// `data: <json>\n\n` framing for the chat dialect. A chunk that fails to
/// encode is skipped, not fatal to the stream.
pub(crate) fn data_frame<T: Serialize>(payload: &T) -> Option<Bytes> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
        Err(err) => {
            log::error!("skipping unencodable stream chunk: {err}");
            None
        }
    }
}

/// `event: <name>\ndata: <json>\n\n` framing for the responses dialect.
pub(crate) fn event_frame<T: Serialize>(name: &str, payload: &T) -> Option<Bytes> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Bytes::from(format!("event: {name}\ndata: {json}\n\n"))),
        Err(err) => {
            log::error!("skipping unencodable stream event: {err}");
            None
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseLifecyclePayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    response: ResponseSummary<'a>,
}

#[derive(Debug, Serialize)]
struct ResponseSummary<'a> {
    id: &'a str,
    object: &'a str,
    created_at: i64,
    model: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Serialize)]
struct OutputTextDeltaPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    delta: &'a str,
}

pub(crate) fn response_created_frame(id: &str, model: &str) -> Option<Bytes> {
    event_frame(
        EVENT_RESPONSE_CREATED,
        &ResponseLifecyclePayload {
            kind: EVENT_RESPONSE_CREATED,
            response: ResponseSummary {
                id,
                object: OBJECT_RESPONSE,
                created_at: unix_now(),
                model,
                status: STATUS_IN_PROGRESS,
                usage: None,
            },
        },
    )
}

pub(crate) fn output_text_delta_frame(text: &str) -> Option<Bytes> {
    event_frame(
        EVENT_OUTPUT_TEXT_DELTA,
        &OutputTextDeltaPayload {
            kind: EVENT_OUTPUT_TEXT_DELTA,
            delta: text,
        },
    )
}

pub(crate) fn response_completed_frame(
    id: &str,
    model: &str,
    usage: Option<ResponsesUsage>,
) -> Option<Bytes> {
    event_frame(
        EVENT_RESPONSE_COMPLETED,
        &ResponseLifecyclePayload {
            kind: EVENT_RESPONSE_COMPLETED,
            response: ResponseSummary {
                id,
                object: OBJECT_RESPONSE,
                created_at: unix_now(),
                model,
                status: STATUS_COMPLETED,
                usage,
            },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_shape() {
        let chunk = ChatChunk::content("id", "m", "p", "hey");
        let frame = data_frame(&chunk).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn test_event_frame_names_event() {
        let frame = output_text_delta_frame("Hi").unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: response.output_text.delta\ndata: "));
        let json: serde_json::Value =
            serde_json::from_str(text.lines().nth(1).unwrap().trim_start_matches("data: ")).unwrap();
        assert_eq!(json["delta"], "Hi");
    }

    #[test]
    fn test_completed_frame_includes_usage() {
        let frame =
            response_completed_frame("resp_1", "m", Some(ResponsesUsage::new(2, 3))).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(text.lines().nth(1).unwrap().trim_start_matches("data: ")).unwrap();
        assert_eq!(json["response"]["status"], "completed");
        assert_eq!(json["response"]["usage"]["total_tokens"], 5);
    }
}
