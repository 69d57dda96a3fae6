use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatRequest, ChatResponse, CompletionResponse, WireMessage};
use crate::core::controller::RequestKey;
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;

/// One event from an in-flight streamed request, tagged with the request it
/// belongs to. `Delta` carries an incremental content chunk; `Error` carries
/// pre-formatted error text; `End` is always the final event.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Delta(String),
    Error(String),
    End,
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(
    payload: &str,
    tx: &mpsc::UnboundedSender<(StreamEvent, RequestKey)>,
    key: &RequestKey,
) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send((StreamEvent::End, key.clone()));
        return true;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(choice) = response.choices.first() {
                if let Some(content) = &choice.delta.content {
                    let _ = tx.send((StreamEvent::Delta(content.clone()), key.clone()));
                }
            }
            false
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }

            let formatted_error = format_api_error(payload);
            let _ = tx.send((StreamEvent::Error(formatted_error), key.clone()));
            let _ = tx.send((StreamEvent::End, key.clone()));
            true
        }
    }
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamEvent, RequestKey)>,
    key: &RequestKey,
) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, key))
        .unwrap_or(false)
}

fn send_aborted(tx: &mpsc::UnboundedSender<(StreamEvent, RequestKey)>, key: &RequestKey) {
    let aborted = format_api_error(r#"{"message":"aborted"}"#);
    let _ = tx.send((StreamEvent::Error(aborted), key.clone()));
    let _ = tx.send((StreamEvent::End, key.clone()));
}

/// Drain an SSE body chunk by chunk, framing on newlines. Cancellation
/// observed between chunks still surfaces as an aborted error followed by
/// `End`, so the message always reaches a terminal state even when the
/// in-flight chunk wins the race against the cancelled-token branch of the
/// caller's select.
async fn pump_sse_stream<S, B, E>(
    mut stream: S,
    tx: &mpsc::UnboundedSender<(StreamEvent, RequestKey)>,
    key: &RequestKey,
    cancel_token: &CancellationToken,
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        if cancel_token.is_cancelled() {
            send_aborted(tx, key);
            return;
        }

        if let Ok(chunk_bytes) = chunk {
            buffer.extend_from_slice(chunk_bytes.as_ref());

            while let Some(newline_pos) = memchr(b'\n', &buffer) {
                let line_str = match std::str::from_utf8(&buffer[..newline_pos]) {
                    Ok(s) => s.trim(),
                    Err(e) => {
                        tracing::warn!("invalid UTF-8 in stream: {e}");
                        buffer.drain(..=newline_pos);
                        continue;
                    }
                };

                let should_end = process_sse_line(line_str, tx, key);
                buffer.drain(..=newline_pos);
                if should_end {
                    return;
                }
            }
        }
    }

    let _ = tx.send((StreamEvent::End, key.clone()));
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Pretty-print a raw error body into a fenced block with a one-line
/// summary when one can be extracted.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}

/// Connection details for one provider endpoint.
#[derive(Clone)]
pub struct ProviderEndpoint {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub provider_name: String,
}

pub struct StreamParams {
    pub endpoint: ProviderEndpoint,
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub cancel_token: CancellationToken,
    pub key: RequestKey,
}

#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamEvent, RequestKey)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamEvent, RequestKey)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Spawn a streamed chat request. Events arrive on the receiver paired
    /// with this service; cancellation surfaces as an "aborted" error event
    /// followed by `End`.
    pub fn spawn_stream(&self, params: StreamParams) {
        let tx_clone = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                endpoint,
                model,
                messages,
                max_tokens,
                temperature,
                top_p,
                cancel_token,
                key,
            } = params;

            let request = ChatRequest {
                model,
                messages,
                stream: true,
                max_tokens,
                temperature,
                top_p,
            };
            let abort_key = key.clone();

            tokio::select! {
                _ = async {
                    let chat_url = construct_api_url(&endpoint.base_url, "chat/completions");
                    let http_request = endpoint
                        .client
                        .post(chat_url)
                        .header("Content-Type", "application/json");

                    let http_request = add_auth_headers(
                        http_request,
                        &endpoint.provider_name,
                        &endpoint.api_key,
                    );

                    match http_request.json(&request).send().await {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let error_text = response
                                    .text()
                                    .await
                                    .unwrap_or_else(|_| "<no body>".to_string());
                                let formatted_error = format_api_error(&error_text);
                                let _ = tx_clone
                                    .send((StreamEvent::Error(formatted_error), key.clone()));
                                let _ = tx_clone.send((StreamEvent::End, key.clone()));
                                return;
                            }

                            let stream = response.bytes_stream();
                            pump_sse_stream(stream, &tx_clone, &key, &cancel_token).await;
                        }
                        Err(e) => {
                            let formatted_error = format_api_error(&e.to_string());
                            let _ = tx_clone
                                .send((StreamEvent::Error(formatted_error), key.clone()));
                            let _ = tx_clone.send((StreamEvent::End, key.clone()));
                        }
                    }
                } => {}
                _ = cancel_token.cancelled() => {
                    send_aborted(&tx_clone, &abort_key);
                }
            }
        });
    }

    #[cfg(test)]
    pub fn send_for_test(&self, event: StreamEvent, key: RequestKey) {
        let _ = self.tx.send((event, key));
    }
}

/// Issue a non-streamed completion and return the reply text. Used for
/// background calls (topic generation, memory compaction) where streaming
/// buys nothing.
pub async fn complete(
    endpoint: &ProviderEndpoint,
    model: &str,
    messages: Vec<WireMessage>,
    max_tokens: Option<u32>,
) -> Result<String, Box<dyn std::error::Error>> {
    let request = ChatRequest {
        model: model.to_string(),
        messages,
        stream: false,
        max_tokens,
        temperature: None,
        top_p: None,
    };

    let chat_url = construct_api_url(&endpoint.base_url, "chat/completions");
    let http_request = endpoint
        .client
        .post(chat_url)
        .header("Content-Type", "application/json");
    let http_request = add_auth_headers(http_request, &endpoint.provider_name, &endpoint.api_key);

    let response = http_request.json(&request).send().await?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
        return Err(format_api_error(&body).into());
    }

    let completion: CompletionResponse = response.json().await?;
    let reply = completion
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .unwrap_or_default();
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RequestKey {
        RequestKey::new("session-1", "message-1")
    }

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let (service, mut rx) = ChatStreamService::new();
        let variants = [
            (
                r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
                "Hello",
                "data: [DONE]",
            ),
            (
                r#"data:{"choices":[{"delta":{"content":"World"}}]}"#,
                "World",
                "data:[DONE]",
            ),
        ];

        for (chunk_line, expected_chunk, done_line) in variants {
            assert!(!process_sse_line(chunk_line, &service.tx, &key()));
            let (event, received_key) = rx.try_recv().expect("expected delta event");
            assert_eq!(received_key, key());
            match event {
                StreamEvent::Delta(content) => assert_eq!(content, expected_chunk),
                other => panic!("expected delta event, got {:?}", other),
            }

            assert!(process_sse_line(done_line, &service.tx, &key()));
            let (event, _) = rx.try_recv().expect("expected end event");
            assert!(matches!(event, StreamEvent::End));
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn process_sse_line_routes_stream_errors() {
        let (service, mut rx) = ChatStreamService::new();
        let error_line = r#"data: {"error":{"message":"internal server error"}}"#;

        assert!(process_sse_line(error_line, &service.tx, &key()));

        let (event, _) = rx.try_recv().expect("expected error event");
        match event {
            StreamEvent::Error(text) => {
                assert!(text.starts_with("API Error: internal server error"));
                assert!(text.contains("```json"));
            }
            other => panic!("expected error event, got {:?}", other),
        }

        let (event, _) = rx.try_recv().expect("expected end event");
        assert!(matches!(event, StreamEvent::End));
    }

    #[test]
    fn format_api_error_prettifies_json_with_summary() {
        let raw = r#"{"error":{"message":"model overloaded","type":"invalid_request_error"}}"#;
        let formatted = format_api_error(raw);

        let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
        assert_eq!(formatted, expected);
    }

    #[test]
    fn format_api_error_handles_json_without_summary() {
        let raw = r#"{"status":"failed"}"#;
        let formatted = format_api_error(raw);
        assert!(formatted.starts_with("API Error:\n```json"));
        assert!(formatted.contains(r#""status": "failed""#));
    }

    #[tokio::test]
    async fn cancellation_during_chunk_loop_still_emits_aborted_events() {
        let (service, mut rx) = ChatStreamService::new();
        let token = CancellationToken::new();
        let token_in_stream = token.clone();

        // The second chunk cancels the token as it is produced, so the pump
        // sees the cancellation at the top of its loop rather than through
        // the caller's cancelled-token branch.
        let chunks: Vec<Vec<u8>> = vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n".to_vec(),
        ];
        let stream = futures_util::stream::iter(chunks.into_iter().enumerate().map(
            move |(index, chunk)| {
                if index == 1 {
                    token_in_stream.cancel();
                }
                Ok::<_, std::convert::Infallible>(chunk)
            },
        ));

        pump_sse_stream(stream, &service.tx, &key(), &token).await;

        let (event, _) = rx.try_recv().expect("expected delta event");
        match event {
            StreamEvent::Delta(content) => assert_eq!(content, "Hel"),
            other => panic!("expected delta event, got {:?}", other),
        }

        let (event, _) = rx.try_recv().expect("expected aborted error event");
        match event {
            StreamEvent::Error(text) => assert!(text.contains("aborted")),
            other => panic!("expected error event, got {:?}", other),
        }

        let (event, _) = rx.try_recv().expect("expected end event");
        assert!(matches!(event, StreamEvent::End));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn format_api_error_handles_xml_and_plaintext() {
        let xml = "<error>bad</error>";
        let plain = "api failure";

        assert_eq!(
            format_api_error(xml),
            "API Error:\n```xml\n<error>bad</error>\n```"
        );
        assert_eq!(format_api_error(plain), "API Error:\n```\napi failure\n```");
    }
}
