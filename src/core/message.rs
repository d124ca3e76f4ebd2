use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// One persisted (or optimistically local) message in a conversation.
///
/// Assistant messages carry the model-slot fields identifying which
/// configured backend produced them; together with the resolved parent user
/// message these form a generation group (see [`GroupKey`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub api_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub model_instance_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
}

impl Message {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            thinking: None,
            model: String::new(),
            provider_name: String::new(),
            api_format: String::new(),
            parent_message_id: None,
            model_instance_index: 0,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
            is_streaming: false,
        }
    }

    pub fn assistant(
        id: impl Into<String>,
        content: impl Into<String>,
        slot: ModelSlot,
        parent_message_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            thinking: None,
            model: slot.model,
            provider_name: slot.provider_name,
            api_format: slot.api_format,
            parent_message_id,
            model_instance_index: slot.instance_index,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
            is_streaming: false,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    /// The model slot this assistant message was produced by.
    pub fn slot(&self) -> ModelSlot {
        ModelSlot {
            provider_name: self.provider_name.clone(),
            api_format: self.api_format.clone(),
            model: self.model.clone(),
            instance_index: self.model_instance_index,
        }
    }
}

/// One configured model backend within a fan-out: provider, wire format,
/// model name, and the instance index that disambiguates selecting the same
/// model more than once in a single turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSlot {
    pub provider_name: String,
    pub api_format: String,
    pub model: String,
    #[serde(default)]
    pub instance_index: u32,
}

impl ModelSlot {
    pub fn new(
        provider_name: impl Into<String>,
        api_format: impl Into<String>,
        model: impl Into<String>,
        instance_index: u32,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            api_format: api_format.into(),
            model: model.into(),
            instance_index,
        }
    }
}

/// Identifies a generation group: all alternative answers to one question
/// from one model slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub question_id: String,
    pub slot: ModelSlot,
}

impl GroupKey {
    pub fn new(question_id: impl Into<String>, slot: ModelSlot) -> Self {
        Self {
            question_id: question_id.into(),
            slot,
        }
    }

    /// Key string used in the per-conversation navigation map. The trailing
    /// segment is always the instance index; legacy maps that predate it are
    /// migrated on load (see `core::navigation`).
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.question_id,
            self.slot.provider_name,
            self.slot.api_format,
            self.slot.model,
            self.slot.instance_index
        )
    }
}

/// Payload for persisting one message through the gateway message API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub model_instance_index: u32,
}
