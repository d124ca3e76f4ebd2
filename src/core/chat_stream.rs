use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ChatMessage, ChatRequest, ChatResponse, UsageStats};
use crate::utils::url::construct_api_url;

/// Address of one streaming sub-session: the conversation plus the model
/// slot's instance index. At most one stream is in flight per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub conversation_id: String,
    pub instance_index: u32,
}

impl StreamKey {
    pub fn new(conversation_id: impl Into<String>, instance_index: u32) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            instance_index,
        }
    }
}

/// Identifies which spawn produced an event. Events whose `stream_id` no
/// longer matches the registry entry for the key are stale and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTag {
    pub key: StreamKey,
    pub stream_id: u64,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk {
        content: Option<String>,
        /// Cumulative reasoning snapshot; replaces, never appends.
        thinking: Option<String>,
    },
    Completed {
        usage: Option<UsageStats>,
    },
    Error(String),
}

pub type StreamEnvelope = (StreamEvent, StreamTag);

/// Per-stream request parameters handed to a transport. The events sender
/// is the single funnel back into the orchestrator; the cancel token aborts
/// this stream without touching siblings.
pub struct StreamParams {
    pub provider_name: String,
    pub api_format: String,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub tag: StreamTag,
    pub cancel_token: CancellationToken,
    pub events: mpsc::UnboundedSender<StreamEnvelope>,
}

/// A backend that streams one model answer per [`StreamParams`]. Expected to
/// emit at most one terminal event (`Completed` or `Error`) per stream; the
/// orchestrator tolerates duplicates. A cancelled stream may end silently.
pub trait ChatTransport: Send + Sync {
    fn spawn_stream(&self, params: StreamParams);
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Returns true when the stream is finished and the reader should stop.
fn handle_data_payload(
    payload: &str,
    tx: &mpsc::UnboundedSender<StreamEnvelope>,
    tag: &StreamTag,
    usage: &mut Option<UsageStats>,
) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send((StreamEvent::Completed { usage: usage.take() }, tag.clone()));
        return true;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if response.usage.is_some() {
                *usage = response.usage;
            }
            if let Some(choice) = response.choices.first() {
                let content = choice.delta.content.clone();
                let thinking = choice.delta.thinking.clone();
                if content.is_some() || thinking.is_some() {
                    let _ = tx.send((StreamEvent::Chunk { content, thinking }, tag.clone()));
                }
            }
            false
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }

            let _ = tx.send((StreamEvent::Error(format_api_error(payload)), tag.clone()));
            true
        }
    }
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<StreamEnvelope>,
    tag: &StreamTag,
    usage: &mut Option<UsageStats>,
) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, tag, usage))
        .unwrap_or(false)
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

/// Render a provider error body for display: a one-line summary when the
/// payload carries one, with the raw payload fenced below it.
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

/// Streams chat completions from the gateway over SSE.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl ChatTransport for SseTransport {
    fn spawn_stream(&self, params: StreamParams) {
        let client = self.client.clone();
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let StreamParams {
                provider_name,
                api_format,
                model,
                api_messages,
                tag,
                cancel_token,
                events: tx,
            } = params;

            let request = ChatRequest {
                provider: provider_name,
                api_format,
                model,
                messages: api_messages,
                stream: true,
            };

            tokio::select! {
                _ = async {
                    debug!(stream_id = tag.stream_id, instance = tag.key.instance_index, "opening chat stream");

                    match client
                        .post(&chat_url)
                        .header("Content-Type", "application/json")
                        .bearer_auth(&api_key)
                        .json(&request)
                        .send()
                        .await
                    {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let error_text = response
                                    .text()
                                    .await
                                    .unwrap_or_else(|_| "<no body>".to_string());
                                let _ = tx.send((
                                    StreamEvent::Error(format_api_error(&error_text)),
                                    tag.clone(),
                                ));
                                return;
                            }

                            let mut stream = response.bytes_stream();
                            let mut buffer: Vec<u8> = Vec::new();
                            let mut usage: Option<UsageStats> = None;

                            while let Some(chunk) = stream.next().await {
                                if cancel_token.is_cancelled() {
                                    return;
                                }

                                if let Ok(chunk_bytes) = chunk {
                                    buffer.extend_from_slice(&chunk_bytes);

                                    while let Some(newline_pos) = memchr(b'\n', &buffer) {
                                        let line_str = match std::str::from_utf8(&buffer[..newline_pos]) {
                                            Ok(s) => s.trim(),
                                            Err(e) => {
                                                debug!("invalid UTF-8 in stream: {e}");
                                                buffer.drain(..=newline_pos);
                                                continue;
                                            }
                                        };

                                        let should_end =
                                            process_sse_line(line_str, &tx, &tag, &mut usage);
                                        buffer.drain(..=newline_pos);
                                        if should_end {
                                            return;
                                        }
                                    }
                                }
                            }

                            // Stream closed without [DONE]; still terminal.
                            let _ = tx.send((
                                StreamEvent::Completed { usage: usage.take() },
                                tag.clone(),
                            ));
                        }
                        Err(e) => {
                            let _ = tx.send((
                                StreamEvent::Error(format_api_error(&e.to_string())),
                                tag.clone(),
                            ));
                        }
                    }
                } => {}
                _ = cancel_token.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tag(instance_index: u32, stream_id: u64) -> StreamTag {
        StreamTag {
            key: StreamKey::new("c-1", instance_index),
            stream_id,
        }
    }

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let (tx, mut rx) = mpsc::unbounded_channel();
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

        for (index, (chunk_line, expected_chunk, done_line)) in variants.iter().enumerate() {
            let tag = test_tag(index as u32, index as u64 + 1);
            let mut usage = None;

            assert!(!process_sse_line(chunk_line, &tx, &tag, &mut usage));
            let (event, received_tag) = rx.try_recv().expect("expected chunk event");
            assert_eq!(received_tag, tag);
            match event {
                StreamEvent::Chunk { content, thinking } => {
                    assert_eq!(content.as_deref(), Some(*expected_chunk));
                    assert!(thinking.is_none());
                }
                other => panic!("expected chunk event, got {:?}", other),
            }

            assert!(process_sse_line(done_line, &tx, &tag, &mut usage));
            let (event, received_tag) = rx.try_recv().expect("expected completion event");
            assert_eq!(received_tag, tag);
            assert!(matches!(event, StreamEvent::Completed { .. }));
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn thinking_deltas_ride_alongside_content() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = test_tag(0, 1);
        let mut usage = None;

        let line = r#"data: {"choices":[{"delta":{"content":"so","reasoning":"step one"}}]}"#;
        assert!(!process_sse_line(line, &tx, &tag, &mut usage));

        let (event, _) = rx.try_recv().expect("expected chunk event");
        match event {
            StreamEvent::Chunk { content, thinking } => {
                assert_eq!(content.as_deref(), Some("so"));
                assert_eq!(thinking.as_deref(), Some("step one"));
            }
            other => panic!("expected chunk event, got {:?}", other),
        }
    }

    #[test]
    fn usage_from_final_chunk_arrives_on_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = test_tag(0, 1);
        let mut usage = None;

        let usage_line = r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":25}}"#;
        assert!(!process_sse_line(usage_line, &tx, &tag, &mut usage));
        assert!(rx.try_recv().is_err());

        assert!(process_sse_line("data: [DONE]", &tx, &tag, &mut usage));
        let (event, _) = rx.try_recv().expect("expected completion event");
        match event {
            StreamEvent::Completed { usage } => {
                let usage = usage.expect("usage stats");
                assert_eq!(usage.input_tokens, Some(10));
                assert_eq!(usage.output_tokens, Some(25));
            }
            other => panic!("expected completion event, got {:?}", other),
        }
    }

    #[test]
    fn error_payloads_terminate_the_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = test_tag(1, 99);
        let mut usage = None;

        let error_line = r#"data: {"error":{"message":"internal server error"}}"#;
        assert!(process_sse_line(error_line, &tx, &tag, &mut usage));

        let (event, received_tag) = rx.try_recv().expect("expected error event");
        assert_eq!(received_tag, tag);
        match event {
            StreamEvent::Error(text) => {
                assert!(text.starts_with("API Error: internal server error"));
                assert!(text.contains("```json"));
            }
            other => panic!("expected error event, got {:?}", other),
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn format_api_error_prettifies_json_with_summary() {
        let raw = r#"{"error":{"message":"model overloaded","type":"overloaded_error"}}"#;
        let formatted = format_api_error(raw);

        assert!(formatted.starts_with("API Error: model overloaded"));
        assert!(formatted.contains("\"type\": \"overloaded_error\""));
    }

    #[test]
    fn format_api_error_handles_xml_and_plaintext() {
        assert_eq!(
            format_api_error("<error>bad</error>"),
            "API Error:\n```xml\n<error>bad</error>\n```"
        );
        assert_eq!(
            format_api_error("provider unavailable"),
            "API Error:\n```\nprovider unavailable\n```"
        );
        assert_eq!(format_api_error("   "), "API Error:\n```\n<empty>\n```");
    }
}
