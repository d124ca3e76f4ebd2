use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::client::{ApiError, MessageApi};
use crate::api::{ChatMessage, UsageStats};
use crate::core::chat_stream::{
    ChatTransport, StreamEnvelope, StreamEvent, StreamKey, StreamParams, StreamTag,
};
use crate::core::message::{GroupKey, Message, ModelSlot, NewMessage, Role};
use crate::core::navigation::{GenerationNavigator, NavigationDirection};
use crate::core::reconcile::reconcile;
use crate::core::session::{ControllerRegistry, SessionError, SessionManager, SubSession};
use crate::core::store::MessageStore;
use crate::utils::id::local_message_id;
use crate::utils::kv::KeyValueStore;

/// Cross-cutting notifications for views and other observers. Subscribers
/// receive these after each mutation; a dropped receiver unsubscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotice {
    MessagesChanged,
    StreamingUpdated { instance_index: u32 },
    NavigationChanged,
    SessionFinished,
    StreamError { instance_index: u32, message: String },
}

struct RetryTarget {
    group_key: GroupKey,
    placeholder_id: String,
}

/// The orchestrator facade: owns the message store, the per-slot streaming
/// sub-sessions and their cancellation registry, and the generation
/// navigator for the active conversation.
///
/// All stream events funnel through [`ChatController::handle_stream_event`];
/// it is the only path that mutates shared state from streaming callbacks,
/// which is what keeps concurrent completions race-free.
pub struct ChatController {
    transport: Arc<dyn ChatTransport>,
    message_api: Arc<dyn MessageApi>,
    store: MessageStore,
    navigator: GenerationNavigator,
    sessions: SessionManager,
    registry: ControllerRegistry,
    conversation_id: Option<String>,
    selected_models: Vec<ModelSlot>,
    explicit_selection: bool,
    authenticated: bool,
    is_loading: bool,
    last_error: Option<String>,
    events_tx: mpsc::UnboundedSender<StreamEnvelope>,
    events_rx: mpsc::UnboundedReceiver<StreamEnvelope>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeNotice>>,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        message_api: Arc<dyn MessageApi>,
        state_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            message_api,
            store: MessageStore::new(),
            navigator: GenerationNavigator::new(state_store),
            sessions: SessionManager::new(),
            registry: ControllerRegistry::new(),
            conversation_id: None,
            selected_models: Vec::new(),
            explicit_selection: false,
            authenticated: false,
            is_loading: false,
            last_error: None,
            events_tx,
            events_rx,
            subscribers: Vec::new(),
        }
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn selected_models(&self) -> &[ModelSlot] {
        &self.selected_models
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_streaming(&self) -> bool {
        self.sessions.is_streaming()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Live buffers for a streaming slot of the active conversation, for
    /// rendering a partial bubble: `(content, thinking)`.
    pub fn streaming_preview(&self, instance_index: u32) -> Option<(&str, &str)> {
        let conversation_id = self.conversation_id.as_deref()?;
        let key = StreamKey::new(conversation_id, instance_index);
        let sub = self.sessions.get(&key)?;
        if sub.state.completed {
            return None;
        }
        Some((
            sub.state.content_buffer.as_str(),
            sub.state.thinking_buffer.as_str(),
        ))
    }

    /// Register an observer. Notifications are fire-and-forget; a closed
    /// receiver is pruned on the next notify.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChangeNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, notice: ChangeNotice) {
        self.subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Pin the model selection explicitly; reconciliation stops deriving a
    /// default once a caller has chosen.
    pub fn select_models(&mut self, slots: Vec<ModelSlot>) {
        self.selected_models = slots;
        self.explicit_selection = true;
    }

    /// Switch to a conversation: load its navigation map (migrating legacy
    /// state) and fetch the authoritative message list. Streams belonging to
    /// other conversations are left running; cancel explicitly if needed.
    pub async fn load_conversation(&mut self, conversation_id: &str) -> Result<(), ApiError> {
        if self.conversation_id.as_deref() != Some(conversation_id) {
            self.store.replace_all(Vec::new());
            self.explicit_selection = false;
        }
        self.conversation_id = Some(conversation_id.to_string());
        self.navigator.load(conversation_id);
        self.reload_messages(false).await
    }

    /// Re-fetch the server list and merge it with local state. With `force`
    /// the merge happens even while sub-sessions are streaming.
    pub async fn reload_messages(&mut self, force: bool) -> Result<(), ApiError> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        let server = self.message_api.list(&conversation_id).await?;
        let active = self.sessions.active_keys_for(&conversation_id);
        let outcome = reconcile(self.store.messages(), &server, &active, force);
        if let Some(messages) = outcome.messages {
            self.store.replace_all(messages);
            self.notify(ChangeNotice::MessagesChanged);
        }
        if !self.explicit_selection {
            self.selected_models = outcome.default_selections;
        }
        Ok(())
    }

    /// Send one prompt to every currently selected model slot.
    pub async fn submit_prompt(&mut self, prompt: &str) -> Result<(), SessionError> {
        let selections = self.selected_models.clone();
        self.start_fanout(prompt, selections, None).await
    }

    /// Regenerate one group's answer. The new generation streams into a
    /// placeholder message patched in place, so the bubble keeps its
    /// position; the group's other generations and every sibling slot are
    /// untouched.
    pub async fn retry_generation(&mut self, group_key: &GroupKey) -> Result<(), SessionError> {
        self.check_preconditions(1)?;
        self.store
            .find_group(group_key)
            .ok_or(SessionError::UnknownGroup)?;
        let question = self
            .store
            .get(&group_key.question_id)
            .ok_or(SessionError::UnknownGroup)?
            .content
            .clone();

        let placeholder_id = local_message_id();
        let mut placeholder = Message::assistant(
            placeholder_id.clone(),
            "",
            group_key.slot.clone(),
            Some(group_key.question_id.clone()),
        );
        placeholder.is_streaming = true;
        self.store.push(placeholder);
        self.navigator.pin_retry(group_key, &placeholder_id);
        self.notify(ChangeNotice::NavigationChanged);

        self.start_fanout(
            &question,
            vec![group_key.slot.clone()],
            Some(RetryTarget {
                group_key: group_key.clone(),
                placeholder_id,
            }),
        )
        .await
    }

    fn check_preconditions(&self, selection_count: usize) -> Result<&str, SessionError> {
        let conversation_id = self
            .conversation_id
            .as_deref()
            .ok_or(SessionError::NoActiveConversation)?;
        if selection_count == 0 {
            return Err(SessionError::NoModelSelected);
        }
        if !self.authenticated {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(conversation_id)
    }

    async fn start_fanout(
        &mut self,
        prompt: &str,
        selections: Vec<ModelSlot>,
        retry: Option<RetryTarget>,
    ) -> Result<(), SessionError> {
        let conversation_id = self.check_preconditions(selections.len())?.to_string();

        let question_id = match &retry {
            Some(target) => target.group_key.question_id.clone(),
            None => self.persist_user_message(&conversation_id, prompt).await,
        };

        self.sessions.begin_fanout(retry.is_some());
        self.is_loading = true;

        for selection in &selections {
            let key = StreamKey::new(conversation_id.clone(), selection.instance_index);
            let (cancel_token, stream_id) = self.registry.assume_ownership(key.clone());

            let mut sub = SubSession::new(selection.clone(), &question_id);
            if let Some(target) = &retry {
                sub = sub.patching(&target.placeholder_id);
            }
            self.sessions.register(key.clone(), sub);

            let api_messages = self.build_api_messages(
                selection,
                retry.as_ref().map(|t| t.group_key.question_id.as_str()),
                prompt,
            );

            self.transport.spawn_stream(StreamParams {
                provider_name: selection.provider_name.clone(),
                api_format: selection.api_format.clone(),
                model: selection.model.clone(),
                api_messages,
                tag: StreamTag { key, stream_id },
                cancel_token,
                events: self.events_tx.clone(),
            });
        }

        self.notify(ChangeNotice::MessagesChanged);
        Ok(())
    }

    /// Append the user's turn optimistically, then persist it. A failed save
    /// keeps the local message (and its temporary id) visible; the next
    /// reconciliation re-attaches it.
    async fn persist_user_message(&mut self, conversation_id: &str, prompt: &str) -> String {
        let local_id = local_message_id();
        self.store.push(Message::user(local_id.clone(), prompt));

        let new_message = NewMessage {
            role: Role::User,
            content: prompt.to_string(),
            thinking: None,
            model: String::new(),
            input_tokens: None,
            output_tokens: None,
            provider_name: None,
            api_format: None,
            parent_message_id: None,
            model_instance_index: 0,
        };
        match self.message_api.append(conversation_id, new_message).await {
            Ok(saved) => {
                self.store.adopt_id(&local_id, &saved.id);
                saved.id
            }
            Err(e) => {
                warn!("failed to persist user message: {e}");
                self.last_error = Some(e.to_string());
                local_id
            }
        }
    }

    /// Linear wire context for one slot: each question followed by the
    /// generation currently displayed for that slot (falling back to the
    /// question's first answering slot). A retry stops before the retried
    /// question and re-asks it as the final user turn.
    fn build_api_messages(
        &self,
        slot: &ModelSlot,
        stop_before_question: Option<&str>,
        prompt: &str,
    ) -> Vec<ChatMessage> {
        let mut api_messages = Vec::new();
        for question in self.store.groups() {
            if Some(question.question.id.as_str()) == stop_before_question {
                break;
            }
            api_messages.push(ChatMessage {
                role: Role::User.as_str().to_string(),
                content: question.question.content.clone(),
            });
            let group = question
                .groups
                .iter()
                .find(|g| g.key.slot == *slot)
                .or_else(|| question.groups.first());
            if let Some(group) = group {
                if let Some(current) = self.navigator.current(group) {
                    if !current.content.is_empty() {
                        api_messages.push(ChatMessage {
                            role: Role::Assistant.as_str().to_string(),
                            content: current.content.clone(),
                        });
                    }
                }
            }
        }
        if stop_before_question.is_some() {
            api_messages.push(ChatMessage {
                role: Role::User.as_str().to_string(),
                content: prompt.to_string(),
            });
        }
        api_messages
    }

    /// Apply queued stream events without blocking.
    pub async fn pump_events(&mut self) {
        while let Ok((event, tag)) = self.events_rx.try_recv() {
            self.handle_stream_event(event, tag).await;
        }
    }

    /// Apply events until the current fan-out has fully completed.
    pub async fn run_until_idle(&mut self) {
        while self.sessions.fanout_in_flight() {
            let Some((event, tag)) = self.events_rx.recv().await else {
                break;
            };
            self.handle_stream_event(event, tag).await;
        }
    }

    /// The single mutation path for streaming callbacks. Events from
    /// superseded or cancelled streams are dropped here by the stream-id
    /// check; everything after it may assume the event is current.
    pub async fn handle_stream_event(&mut self, event: StreamEvent, tag: StreamTag) {
        if !self.registry.is_current(&tag) {
            debug!(stream_id = tag.stream_id, "dropping stale stream event");
            return;
        }

        match event {
            StreamEvent::Chunk { content, thinking } => self.apply_chunk(tag, content, thinking),
            StreamEvent::Completed { usage } => self.complete_sub_session(tag, usage).await,
            StreamEvent::Error(message) => self.fail_sub_session(tag, message).await,
        }
    }

    fn apply_chunk(&mut self, tag: StreamTag, content: Option<String>, thinking: Option<String>) {
        let Some(sub) = self.sessions.get_mut(&tag.key) else {
            return;
        };
        if sub.state.completed {
            return;
        }
        if let Some(text) = content {
            sub.state.append_content(&text);
        }
        if let Some(snapshot) = thinking {
            sub.state.replace_thinking(&snapshot);
        }

        // Retries stream straight into their placeholder bubble.
        if let Some(placeholder_id) = sub.patch_message_id.clone() {
            let content_now = sub.state.content_buffer.clone();
            let thinking_now = sub.state.thinking_buffer.clone();
            self.store.patch(&placeholder_id, |m| {
                m.content = content_now;
                m.thinking = if thinking_now.is_empty() {
                    None
                } else {
                    Some(thinking_now)
                };
            });
        }

        self.notify(ChangeNotice::StreamingUpdated {
            instance_index: tag.key.instance_index,
        });
    }

    async fn complete_sub_session(&mut self, tag: StreamTag, usage: Option<UsageStats>) {
        let (slot, question_id, patch_id, content, thinking) = {
            let Some(sub) = self.sessions.get_mut(&tag.key) else {
                return;
            };
            if !sub.state.complete_once() {
                debug!(
                    instance = tag.key.instance_index,
                    "ignoring duplicate completion"
                );
                return;
            }
            (
                sub.slot.clone(),
                sub.question_id.clone(),
                sub.patch_message_id.clone(),
                sub.state.content_buffer.clone(),
                match sub.state.thinking_buffer.is_empty() {
                    true => None,
                    false => Some(sub.state.thinking_buffer.clone()),
                },
            )
        };
        self.registry.release(&tag);

        let new_message = NewMessage {
            role: Role::Assistant,
            content: content.clone(),
            thinking: thinking.clone(),
            model: slot.model.clone(),
            input_tokens: usage.and_then(|u| u.input_tokens),
            output_tokens: usage.and_then(|u| u.output_tokens),
            provider_name: Some(slot.provider_name.clone()),
            api_format: Some(slot.api_format.clone()),
            parent_message_id: Some(question_id.clone()),
            model_instance_index: slot.instance_index,
        };

        let saved = self
            .message_api
            .append(&tag.key.conversation_id, new_message)
            .await;
        let is_active_conversation =
            self.conversation_id.as_deref() == Some(tag.key.conversation_id.as_str());

        if is_active_conversation {
            let group_key = GroupKey::new(question_id.clone(), slot.clone());
            match (saved, &patch_id) {
                (Ok(saved), Some(placeholder_id)) => {
                    self.store.patch(placeholder_id, |m| {
                        m.content = content;
                        m.thinking = thinking;
                        m.input_tokens = saved.input_tokens;
                        m.output_tokens = saved.output_tokens;
                        m.created_at = saved.created_at;
                        m.is_streaming = false;
                    });
                    self.store.adopt_id(placeholder_id, &saved.id);
                    self.navigator.pin_retry(&group_key, &saved.id);
                    self.notify(ChangeNotice::NavigationChanged);
                }
                (Ok(saved), None) => {
                    self.store.push(saved);
                }
                (Err(e), maybe_placeholder) => {
                    // The user already saw the answer; keep it locally.
                    warn!("failed to persist streamed answer: {e}");
                    self.last_error = Some(e.to_string());
                    match maybe_placeholder {
                        Some(placeholder_id) => {
                            self.store.patch(placeholder_id, |m| {
                                m.content = content;
                                m.thinking = thinking;
                                m.input_tokens = usage.and_then(|u| u.input_tokens);
                                m.output_tokens = usage.and_then(|u| u.output_tokens);
                                m.is_streaming = false;
                            });
                            self.navigator.pin_retry(&group_key, placeholder_id);
                        }
                        None => {
                            let mut local = Message::assistant(
                                local_message_id(),
                                content,
                                slot,
                                Some(question_id),
                            );
                            local.thinking = thinking;
                            local.input_tokens = usage.and_then(|u| u.input_tokens);
                            local.output_tokens = usage.and_then(|u| u.output_tokens);
                            self.store.push(local);
                        }
                    }
                }
            }
            self.notify(ChangeNotice::MessagesChanged);
        } else if let Err(e) = saved {
            warn!(
                "failed to persist streamed answer for a background conversation: {e}"
            );
        }

        self.maybe_finish_fanout().await;
    }

    async fn fail_sub_session(&mut self, tag: StreamTag, message: String) {
        let patch_id = {
            let Some(sub) = self.sessions.get_mut(&tag.key) else {
                return;
            };
            // Errors converge the aggregate check but persist nothing.
            if !sub.state.complete_once() {
                return;
            }
            sub.patch_message_id.clone()
        };
        self.registry.release(&tag);

        let is_active_conversation =
            self.conversation_id.as_deref() == Some(tag.key.conversation_id.as_str());
        if is_active_conversation {
            if let Some(placeholder_id) = patch_id {
                // A failed retry falls back to the previously shown
                // generation.
                self.store.remove(&placeholder_id);
                self.notify(ChangeNotice::MessagesChanged);
            }
        }

        warn!(instance = tag.key.instance_index, "stream failed: {message}");
        self.last_error = Some(message.clone());
        self.notify(ChangeNotice::StreamError {
            instance_index: tag.key.instance_index,
            message,
        });

        self.maybe_finish_fanout().await;
    }

    async fn maybe_finish_fanout(&mut self) {
        if !self.sessions.fanout_completed() {
            return;
        }
        let was_retry = self.sessions.fanout_is_retry();
        self.sessions.discard_completed();
        self.is_loading = false;

        if !was_retry {
            if let Err(e) = self.reload_messages(false).await {
                warn!("failed to reload conversation after session end: {e}");
                self.last_error = Some(e.to_string());
            }
        }
        self.notify(ChangeNotice::SessionFinished);
    }

    /// Step a group's displayed generation, wrapping at either end.
    pub fn navigate_generation(
        &mut self,
        group_key: &GroupKey,
        direction: NavigationDirection,
    ) -> Option<String> {
        let navigated = {
            let group = self.store.find_group(group_key)?;
            self.navigator.navigate(group, direction)
        };
        if navigated.is_some() {
            self.notify(ChangeNotice::NavigationChanged);
        }
        navigated
    }

    /// The generation currently displayed for a group.
    pub fn current_generation(&self, group_key: &GroupKey) -> Option<&Message> {
        let group = self.store.find_group(group_key)?;
        self.navigator.current(group)
    }

    /// Cancel one slot's in-flight stream; siblings keep going. The aborted
    /// output is discarded, never partially saved.
    pub async fn cancel_instance(&mut self, instance_index: u32) {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return;
        };
        let key = StreamKey::new(conversation_id, instance_index);
        self.registry.cancel(&key);
        if let Some(sub) = self.sessions.remove(&key) {
            if let Some(placeholder_id) = sub.patch_message_id {
                self.store.remove(&placeholder_id);
                self.notify(ChangeNotice::MessagesChanged);
            }
        }
        self.maybe_finish_fanout().await;
    }

    /// Cancel everything this controller has in flight, in any conversation.
    pub fn cancel_all(&mut self) {
        self.registry.cancel_all();
        self.sessions = SessionManager::new();
        self.is_loading = false;
        self.notify(ChangeNotice::SessionFinished);
    }
}
