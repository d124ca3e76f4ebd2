#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use chrono::{DateTime, Duration, TimeZone, Utc};

#[cfg(test)]
use crate::api::client::{ApiError, MessageApi};
#[cfg(test)]
use crate::core::chat_stream::{ChatTransport, StreamParams};
#[cfg(test)]
use crate::core::message::{Message, NewMessage, Role};

#[cfg(test)]
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

#[cfg(test)]
pub fn user_at(id: &str, content: &str, minutes: i64) -> Message {
    let mut msg = Message::user(id, content);
    msg.created_at = base_time() + Duration::minutes(minutes);
    msg
}

/// Assistant fixture; the api format mirrors the provider name, which is
/// what the gateway reports for its built-in providers.
#[cfg(test)]
pub fn assistant_at(
    id: &str,
    content: &str,
    provider: &str,
    model: &str,
    instance_index: u32,
    parent: Option<&str>,
    minutes: i64,
) -> Message {
    Message {
        id: id.to_string(),
        role: Role::Assistant,
        content: content.to_string(),
        thinking: None,
        model: model.to_string(),
        provider_name: provider.to_string(),
        api_format: provider.to_string(),
        parent_message_id: parent.map(str::to_string),
        model_instance_index: instance_index,
        input_tokens: None,
        output_tokens: None,
        created_at: base_time() + Duration::minutes(minutes),
        is_streaming: false,
    }
}

/// In-memory message API: appends allocate sequential authoritative ids.
/// Flip `fail_appends` to exercise the save-failure path.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryMessageApi {
    records: Mutex<Vec<(String, Message)>>,
    next_id: AtomicU64,
    pub fail_appends: AtomicBool,
}

#[cfg(test)]
impl MemoryMessageApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, conversation_id: &str, messages: Vec<Message>) {
        let mut records = self.records.lock().expect("records lock");
        for msg in messages {
            records.push((conversation_id.to_string(), msg));
        }
    }

    pub fn saved(&self, conversation_id: &str) -> Vec<Message> {
        self.records
            .lock()
            .expect("records lock")
            .iter()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl MessageApi for MemoryMessageApi {
    async fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, ApiError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                url: format!("memory://conversations/{conversation_id}/messages"),
                status: 500,
                body: "append disabled by test".into(),
            });
        }

        let serial = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let saved = Message {
            id: format!("m-{serial}"),
            role: message.role,
            content: message.content,
            thinking: message.thinking,
            model: message.model,
            provider_name: message.provider_name.unwrap_or_default(),
            api_format: message.api_format.unwrap_or_default(),
            parent_message_id: message.parent_message_id,
            model_instance_index: message.model_instance_index,
            input_tokens: message.input_tokens,
            output_tokens: message.output_tokens,
            // Saves land after any fixture timestamp, in append order.
            created_at: Utc::now() + Duration::milliseconds(serial as i64),
            is_streaming: false,
        };
        self.records
            .lock()
            .expect("records lock")
            .push((conversation_id.to_string(), saved.clone()));
        Ok(saved)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        Ok(self.saved(conversation_id))
    }
}

/// Transport that records every spawn instead of opening a connection.
/// Tests feed events back through the recorded params' sender and tag.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    spawned: Mutex<Vec<StreamParams>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_spawned(&self) -> Vec<StreamParams> {
        std::mem::take(&mut *self.spawned.lock().expect("spawned lock"))
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().expect("spawned lock").len()
    }
}

#[cfg(test)]
impl ChatTransport for RecordingTransport {
    fn spawn_stream(&self, params: StreamParams) {
        self.spawned.lock().expect("spawned lock").push(params);
    }
}
