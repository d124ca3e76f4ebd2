use serde::{Deserialize, Serialize};

#[derive(Serialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of a streaming chat request routed through the gateway. The gateway
/// forwards to the named provider in the named wire format.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub provider: String,
    pub api_format: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
    /// Cumulative reasoning snapshot; each delta replaces the previous one.
    #[serde(default, alias = "reasoning")]
    pub thinking: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatResponseChoice>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
}

/// Token accounting reported by the provider on the final stream chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(alias = "prompt_tokens")]
    pub input_tokens: Option<u64>,
    #[serde(alias = "completion_tokens")]
    pub output_tokens: Option<u64>,
}

pub mod client;

pub use client::{ApiError, GatewayClient, MessageApi};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_accepts_reasoning_alias() {
        let delta: ChatResponseDelta =
            serde_json::from_str(r#"{"content":null,"reasoning":"thinking..."}"#)
                .expect("delta with reasoning");
        assert_eq!(delta.thinking.as_deref(), Some("thinking..."));
    }

    #[test]
    fn usage_accepts_openai_field_names() {
        let usage: UsageStats =
            serde_json::from_str(r#"{"prompt_tokens":12,"completion_tokens":34}"#)
                .expect("usage stats");
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(34));
    }

    #[test]
    fn chat_request_serializes_gateway_routing_fields() {
        let request = ChatRequest {
            provider: "openrouter".into(),
            api_format: "openai".into(),
            model: "gpt-4o".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "Hi".into(),
            }],
            stream: true,
        };
        let value = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(value["apiFormat"], "openai");
        assert_eq!(value["stream"], true);
    }
}
