// Batch lifecycle against the provider's message-batches endpoints, plus the
// NDJSON results decoder

use crate::core::error::Error;
use crate::core::request_id::RequestContext;
use crate::core::types::*;
use crate::providers::anthropic::{build_messages_request, AnthropicProvider, MessagesRequest, PROVIDER_NAME};
use crate::providers::responses_bridge;
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// Result rows longer than this are treated as corrupt and skipped.
const MAX_RESULT_LINE_BYTES: usize = 4 * 1024 * 1024;

pub(crate) async fn create(
    provider: &AnthropicProvider,
    ctx: &RequestContext,
    req: BatchRequest,
) -> Result<Batch, Error> {
    if req.requests.is_empty() {
        return Err(Error::invalid_request(
            "batch must contain at least one request",
        ));
    }

    let mut requests = Vec::with_capacity(req.requests.len());
    for (index, sub) in req.requests.iter().enumerate() {
        requests.push(convert_sub_request(index, sub)?);
    }

    let wire: WireBatch = provider
        .http
        .post_json(ctx, "/messages/batches", &WireBatchCreate { requests })
        .await?;
    Ok(convert_batch(wire))
}

pub(crate) async fn get(
    provider: &AnthropicProvider,
    ctx: &RequestContext,
    id: &str,
) -> Result<Batch, Error> {
    let wire: WireBatch = provider
        .http
        .get_json(ctx, &format!("/messages/batches/{id}"))
        .await?;
    Ok(convert_batch(wire))
}

/// The gateway's opaque `after` cursor maps onto the provider's
/// reverse-chronological `before_id`.
pub(crate) async fn list(
    provider: &AnthropicProvider,
    ctx: &RequestContext,
    after: Option<&str>,
    limit: Option<u32>,
) -> Result<BatchList, Error> {
    let mut query = Vec::new();
    if let Some(limit) = limit {
        query.push(format!("limit={limit}"));
    }
    if let Some(after) = after {
        query.push(format!("before_id={after}"));
    }
    let path = if query.is_empty() {
        "/messages/batches".to_string()
    } else {
        format!("/messages/batches?{}", query.join("&"))
    };

    let wire: WireBatchList = provider.http.get_json(ctx, &path).await?;
    Ok(BatchList {
        object: "list".to_string(),
        data: wire.data.into_iter().map(convert_batch).collect(),
        has_more: wire.has_more,
        last_id: wire.last_id,
    })
}

pub(crate) async fn cancel(
    provider: &AnthropicProvider,
    ctx: &RequestContext,
    id: &str,
) -> Result<Batch, Error> {
    let wire: WireBatch = provider
        .http
        .post_empty(ctx, &format!("/messages/batches/{id}/cancel"))
        .await?;
    Ok(convert_batch(wire))
}

pub(crate) async fn results(
    provider: &AnthropicProvider,
    ctx: &RequestContext,
    id: &str,
) -> Result<Vec<BatchResultItem>, Error> {
    let body = provider
        .http
        .fetch_bytes(ctx, Method::GET, &format!("/messages/batches/{id}/results"))
        .await?;
    Ok(parse_results(&body))
}

// ============================================================================
// Sub-request validation and conversion
// ============================================================================

fn convert_sub_request(index: usize, sub: &BatchSubRequest) -> Result<WireBatchItem, Error> {
    if !sub.method.eq_ignore_ascii_case("POST") {
        return Err(Error::invalid_request(format!(
            "batch request {index}: method must be POST, got '{}'",
            sub.method
        )));
    }

    let params = match sub.url.as_str() {
        BATCH_URL_CHAT => {
            let chat: ChatRequest = serde_json::from_value(sub.body.clone()).map_err(|err| {
                Error::invalid_request(format!("batch request {index}: invalid chat body: {err}"))
            })?;
            if chat.stream {
                return Err(Error::invalid_request(format!(
                    "batch request {index}: streaming is not allowed inside a batch"
                )));
            }
            build_messages_request(&chat, false)?
        }
        BATCH_URL_RESPONSES => {
            let responses: ResponsesRequest =
                serde_json::from_value(sub.body.clone()).map_err(|err| {
                    Error::invalid_request(format!(
                        "batch request {index}: invalid responses body: {err}"
                    ))
                })?;
            if responses.stream {
                return Err(Error::invalid_request(format!(
                    "batch request {index}: streaming is not allowed inside a batch"
                )));
            }
            let chat = responses_bridge::responses_to_chat(&responses);
            build_messages_request(&chat, false)?
        }
        BATCH_URL_EMBEDDINGS => {
            return Err(Error::invalid_request(format!(
                "batch request {index}: anthropic does not support embeddings"
            )));
        }
        other => {
            return Err(Error::invalid_request(format!(
                "batch request {index}: unsupported url '{other}'"
            )));
        }
    };

    let custom_id = sub
        .custom_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("req-{index}"));

    Ok(WireBatchItem { custom_id, params })
}

// ============================================================================
// Status and entity mapping
// ============================================================================

fn map_status(processing_status: &str, counts: &WireCounts) -> BatchStatus {
    match processing_status {
        "in_progress" => BatchStatus::InProgress,
        "canceling" => BatchStatus::Cancelling,
        "ended" => {
            if counts.canceled > 0 && counts.succeeded == 0 && counts.errored == 0 {
                BatchStatus::Cancelled
            } else if counts.errored > 0 && counts.succeeded == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            }
        }
        other => {
            log::warn!("unknown batch processing_status '{other}', treating as in_progress");
            BatchStatus::InProgress
        }
    }
}

fn parse_ts(value: Option<&str>) -> Option<i64> {
    value
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.timestamp())
}

fn convert_batch(wire: WireBatch) -> Batch {
    let status = map_status(&wire.processing_status, &wire.request_counts);
    let counts = &wire.request_counts;
    let total = counts.processing + counts.succeeded + counts.errored + counts.canceled + counts.expired;

    Batch {
        id: wire.id.clone(),
        object: OBJECT_BATCH.to_string(),
        status,
        created_at: parse_ts(wire.created_at.as_deref()).unwrap_or_else(unix_now),
        completed_at: parse_ts(wire.ended_at.as_deref()),
        cancelling_at: parse_ts(wire.cancel_initiated_at.as_deref()),
        request_counts: BatchRequestCounts {
            total,
            completed: counts.succeeded,
            failed: counts.errored,
        },
        provider_batch_id: Some(wire.id),
    }
}

// ============================================================================
// Results decoding
// ============================================================================

/// Decode newline-delimited result rows. Corrupt or oversized lines are
/// skipped with a warning; the rest of the file still parses.
pub(crate) fn parse_results(body: &[u8]) -> Vec<BatchResultItem> {
    let mut items = Vec::new();

    for line in body.split(|b| *b == b'\n') {
        let line = trim_line(line);
        if line.is_empty() {
            continue;
        }
        if line.len() > MAX_RESULT_LINE_BYTES {
            log::warn!(
                "skipping batch result line of {} bytes (limit {})",
                line.len(),
                MAX_RESULT_LINE_BYTES
            );
            continue;
        }

        let row: WireResultRow = match serde_json::from_slice(line) {
            Ok(row) => row,
            Err(err) => {
                log::warn!("skipping unparseable batch result line: {err}");
                continue;
            }
        };

        let index = items.len();
        match row.result.kind.as_str() {
            "succeeded" => {
                let response = row.result.message;
                let model = response
                    .as_ref()
                    .and_then(|v| v.get("model"))
                    .and_then(|m| m.as_str())
                    .map(String::from);
                items.push(BatchResultItem {
                    index,
                    custom_id: row.custom_id,
                    url: None,
                    provider: PROVIDER_NAME.to_string(),
                    status_code: 200,
                    model,
                    response,
                    error: None,
                });
            }
            "errored" => {
                items.push(BatchResultItem {
                    index,
                    custom_id: row.custom_id,
                    url: None,
                    provider: PROVIDER_NAME.to_string(),
                    status_code: 400,
                    model: None,
                    response: None,
                    error: Some(convert_row_error(row.result.error, "errored")),
                });
            }
            "canceled" => {
                items.push(BatchResultItem {
                    index,
                    custom_id: row.custom_id,
                    url: None,
                    provider: PROVIDER_NAME.to_string(),
                    status_code: 499,
                    model: None,
                    response: None,
                    error: Some(convert_row_error(row.result.error, "canceled")),
                });
            }
            "expired" => {
                items.push(BatchResultItem {
                    index,
                    custom_id: row.custom_id,
                    url: None,
                    provider: PROVIDER_NAME.to_string(),
                    status_code: 408,
                    model: None,
                    response: None,
                    error: Some(convert_row_error(row.result.error, "expired")),
                });
            }
            other => {
                log::warn!("skipping batch result row with unknown type '{other}'");
            }
        }
    }

    items
}

fn trim_line(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn convert_row_error(error: Option<WireResultError>, fallback_kind: &str) -> BatchError {
    match error {
        Some(err) => BatchError {
            kind: err.kind.unwrap_or_else(|| fallback_kind.to_string()),
            message: err
                .message
                .unwrap_or_else(|| format!("request {fallback_kind}")),
        },
        None => BatchError {
            kind: fallback_kind.to_string(),
            message: format!("request {fallback_kind}"),
        },
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct WireBatchCreate {
    requests: Vec<WireBatchItem>,
}

#[derive(Debug, Serialize)]
struct WireBatchItem {
    custom_id: String,
    params: MessagesRequest,
}

#[derive(Debug, Deserialize)]
struct WireBatch {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: WireCounts,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    ended_at: Option<String>,
    #[serde(default)]
    cancel_initiated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireCounts {
    #[serde(default)]
    processing: u32,
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    errored: u32,
    #[serde(default)]
    canceled: u32,
    #[serde(default)]
    expired: u32,
}

#[derive(Debug, Deserialize)]
struct WireBatchList {
    #[serde(default)]
    data: Vec<WireBatch>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResultRow {
    custom_id: String,
    result: WireResult,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireResultError>,
}

#[derive(Debug, Deserialize)]
struct WireResultError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(url: &str, body: serde_json::Value) -> BatchSubRequest {
        BatchSubRequest {
            custom_id: None,
            method: "POST".to_string(),
            url: url.to_string(),
            body,
        }
    }

    fn chat_body() -> serde_json::Value {
        serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "Hello"}]
        })
    }

    #[test]
    fn test_convert_sub_request_forges_custom_id() {
        let item = convert_sub_request(2, &sub(BATCH_URL_CHAT, chat_body())).unwrap();
        assert_eq!(item.custom_id, "req-2");
    }

    #[test]
    fn test_convert_sub_request_keeps_custom_id() {
        let mut request = sub(BATCH_URL_CHAT, chat_body());
        request.custom_id = Some("mine".to_string());
        let item = convert_sub_request(0, &request).unwrap();
        assert_eq!(item.custom_id, "mine");
    }

    #[test]
    fn test_convert_sub_request_rejects_get() {
        let mut request = sub(BATCH_URL_CHAT, chat_body());
        request.method = "GET".to_string();
        let err = convert_sub_request(0, &request).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_convert_sub_request_rejects_streaming_body() {
        let mut body = chat_body();
        body["stream"] = serde_json::json!(true);
        let err = convert_sub_request(0, &sub(BATCH_URL_CHAT, body)).unwrap_err();
        assert!(err.to_string().contains("streaming"));
    }

    #[test]
    fn test_convert_sub_request_rejects_embeddings_and_unknown_urls() {
        let err = convert_sub_request(0, &sub(BATCH_URL_EMBEDDINGS, chat_body())).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = convert_sub_request(0, &sub("/v1/images", chat_body())).unwrap_err();
        assert!(err.to_string().contains("unsupported url"));
    }

    #[test]
    fn test_convert_sub_request_accepts_responses_body() {
        let body = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "input": "Summarize this",
            "instructions": "Be brief"
        });
        let item = convert_sub_request(0, &sub(BATCH_URL_RESPONSES, body)).unwrap();
        assert_eq!(item.params.system.as_deref(), Some("Be brief"));
    }

    #[test]
    fn test_status_mapping() {
        let counts = |succeeded, errored, canceled| WireCounts {
            processing: 0,
            succeeded,
            errored,
            canceled,
            expired: 0,
        };
        assert_eq!(map_status("in_progress", &counts(0, 0, 0)), BatchStatus::InProgress);
        assert_eq!(map_status("canceling", &counts(0, 0, 0)), BatchStatus::Cancelling);
        assert_eq!(map_status("ended", &counts(0, 0, 3)), BatchStatus::Cancelled);
        assert_eq!(map_status("ended", &counts(0, 2, 0)), BatchStatus::Failed);
        assert_eq!(map_status("ended", &counts(1, 2, 0)), BatchStatus::Completed);
        assert_eq!(map_status("ended", &counts(2, 0, 1)), BatchStatus::Completed);
    }

    #[test]
    fn test_parse_results_success_and_error_rows() {
        let body = concat!(
            r#"{"custom_id":"a","result":{"type":"succeeded","message":{"model":"x","content":[]}}}"#,
            "\n",
            r#"{"custom_id":"b","result":{"type":"errored","error":{"type":"rate_limit","message":"slow"}}}"#,
            "\n",
        );
        let items = parse_results(body.as_bytes());
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].index, 0);
        assert_eq!(items[0].custom_id, "a");
        assert_eq!(items[0].status_code, 200);
        assert_eq!(items[0].model.as_deref(), Some("x"));
        assert!(items[0].response.is_some());
        assert!(items[0].error.is_none());

        assert_eq!(items[1].index, 1);
        assert_eq!(items[1].custom_id, "b");
        assert_eq!(items[1].status_code, 400);
        assert_eq!(
            items[1].error,
            Some(BatchError {
                kind: "rate_limit".to_string(),
                message: "slow".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_results_skips_corrupt_lines() {
        let body = concat!(
            "{garbage\n",
            r#"{"custom_id":"ok","result":{"type":"succeeded","message":{"model":"m"}}}"#,
            "\n",
        );
        let items = parse_results(body.as_bytes());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].custom_id, "ok");
    }

    #[test]
    fn test_parse_results_skips_oversized_lines() {
        let mut body = Vec::new();
        body.extend_from_slice(br#"{"custom_id":"big","result":{"type":"succeeded","message":{"pad":""#);
        body.extend(std::iter::repeat(b'x').take(MAX_RESULT_LINE_BYTES));
        body.extend_from_slice(b"\"}}}\n");
        body.extend_from_slice(
            br#"{"custom_id":"ok","result":{"type":"succeeded","message":{"model":"m"}}}"#,
        );
        body.push(b'\n');

        let items = parse_results(&body);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].custom_id, "ok");
    }

    #[test]
    fn test_parse_results_maps_terminal_row_kinds() {
        let body = concat!(
            r#"{"custom_id":"c","result":{"type":"canceled"}}"#,
            "\n",
            r#"{"custom_id":"e","result":{"type":"expired"}}"#,
            "\n",
            r#"{"custom_id":"w","result":{"type":"wedged"}}"#,
            "\n",
        );
        let items = parse_results(body.as_bytes());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status_code, 499);
        assert_eq!(items[1].status_code, 408);
        assert_eq!(items[1].error.as_ref().unwrap().kind, "expired");
    }

    #[test]
    fn test_convert_batch_counts_and_ids() {
        let wire = WireBatch {
            id: "msgbatch_1".to_string(),
            processing_status: "ended".to_string(),
            request_counts: WireCounts {
                processing: 0,
                succeeded: 3,
                errored: 1,
                canceled: 0,
                expired: 0,
            },
            created_at: Some("2024-06-01T00:00:00Z".to_string()),
            ended_at: Some("2024-06-01T01:00:00Z".to_string()),
            cancel_initiated_at: None,
        };
        let batch = convert_batch(wire);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.request_counts.total, 4);
        assert_eq!(batch.request_counts.completed, 3);
        assert_eq!(batch.request_counts.failed, 1);
        assert_eq!(batch.provider_batch_id.as_deref(), Some("msgbatch_1"));
        assert!(batch.completed_at.is_some());
    }
}
