use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::core::chat_stream::{StreamKey, StreamTag};
use crate::core::message::ModelSlot;

/// Preconditions checked before a fan-out starts. Any of these aborts the
/// whole session before the first sub-session is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NoModelSelected,
    NoActiveConversation,
    NotAuthenticated,
    /// Retry was requested for a generation group that no longer exists.
    UnknownGroup,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoModelSelected => write!(f, "No model selected"),
            SessionError::NoActiveConversation => write!(f, "No active conversation"),
            SessionError::NotAuthenticated => write!(f, "Not authenticated with the gateway"),
            SessionError::UnknownGroup => write!(f, "No such generation group"),
        }
    }
}

impl StdError for SessionError {}

/// Transient accumulation state for one streaming sub-session.
///
/// `completed` flips exactly once; the duplicate-terminal guard lives in
/// [`StreamingState::complete_once`]. `finished` releases the live cursor in
/// whatever view renders the buffer.
#[derive(Debug, Default)]
pub struct StreamingState {
    pub content_buffer: String,
    pub thinking_buffer: String,
    pub completed: bool,
    pub finished: bool,
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_content(&mut self, chunk: &str) {
        self.content_buffer.push_str(chunk);
    }

    /// Thinking arrives as cumulative snapshots, so each one replaces the
    /// buffer wholesale.
    pub fn replace_thinking(&mut self, snapshot: &str) {
        self.thinking_buffer.clear();
        self.thinking_buffer.push_str(snapshot);
    }

    /// Mark this sub-session terminal. Returns false if it already was, in
    /// which case the caller must treat the event as a duplicate no-op.
    pub fn complete_once(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.finished = true;
        true
    }
}

/// One streaming request to one model slot: which slot, which question it
/// answers, and the accumulated buffers. `patch_message_id` is set for
/// retries, pointing at the placeholder assistant message that streams in
/// place instead of appending a new bubble.
#[derive(Debug)]
pub struct SubSession {
    pub slot: ModelSlot,
    pub question_id: String,
    pub patch_message_id: Option<String>,
    pub state: StreamingState,
}

impl SubSession {
    pub fn new(slot: ModelSlot, question_id: impl Into<String>) -> Self {
        Self {
            slot,
            question_id: question_id.into(),
            patch_message_id: None,
            state: StreamingState::new(),
        }
    }

    pub fn patching(mut self, placeholder_id: impl Into<String>) -> Self {
        self.patch_message_id = Some(placeholder_id.into());
        self
    }
}

/// Owns the sub-session state for the fan-outs of one conversation view.
///
/// Sub-sessions are keyed by `(conversation, instance index)` and survive
/// the start of a later fan-out under a different key, so a retry of one
/// slot never disturbs a sibling slot that is still streaming. The "current
/// fan-out" is the set of keys started by the most recent start call; its
/// aggregate completion is what ends the visible loading state.
#[derive(Debug, Default)]
pub struct SessionManager {
    subs: HashMap<StreamKey, SubSession>,
    current_fanout: Vec<StreamKey>,
    fanout_is_retry: bool,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new fan-out. Entries registered afterwards belong to it.
    pub fn begin_fanout(&mut self, is_retry: bool) {
        self.current_fanout.clear();
        self.fanout_is_retry = is_retry;
    }

    /// Register one sub-session under its key. Replaces (discards) any
    /// previous sub-session state for the key.
    pub fn register(&mut self, key: StreamKey, sub: SubSession) {
        self.subs.insert(key.clone(), sub);
        self.current_fanout.push(key);
    }

    pub fn get(&self, key: &StreamKey) -> Option<&SubSession> {
        self.subs.get(key)
    }

    pub fn get_mut(&mut self, key: &StreamKey) -> Option<&mut SubSession> {
        self.subs.get_mut(key)
    }

    /// Keys with a live (not yet terminal) sub-session, across all fan-outs.
    pub fn active_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .subs
            .iter()
            .filter(|(_, s)| !s.state.completed)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_by_key(|k| k.instance_index);
        keys
    }

    /// Live keys scoped to one conversation; reload guards use this so a
    /// stream in another conversation never blocks a merge here.
    pub fn active_keys_for(&self, conversation_id: &str) -> Vec<StreamKey> {
        self.active_keys()
            .into_iter()
            .filter(|k| k.conversation_id == conversation_id)
            .collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.subs.values().any(|s| !s.state.completed)
    }

    /// Whether the most recent fan-out has sub-sessions still streaming.
    pub fn fanout_in_flight(&self) -> bool {
        !self.current_fanout.is_empty()
            && self
                .current_fanout
                .iter()
                .any(|k| self.subs.get(k).is_some_and(|s| !s.state.completed))
    }

    /// The aggregate "all done" check for the most recent fan-out.
    pub fn fanout_completed(&self) -> bool {
        !self.current_fanout.is_empty()
            && self
                .current_fanout
                .iter()
                .all(|k| self.subs.get(k).is_none_or(|s| s.state.completed))
    }

    pub fn fanout_is_retry(&self) -> bool {
        self.fanout_is_retry
    }

    pub fn fanout_len(&self) -> usize {
        self.current_fanout.len()
    }

    /// Discard transient state once a fan-out has fully completed.
    pub fn discard_completed(&mut self) {
        self.subs.retain(|_, s| !s.state.completed);
        self.current_fanout
            .retain(|k| self.subs.contains_key(k));
    }

    /// Drop one sub-session outright (explicit cancellation).
    pub fn remove(&mut self, key: &StreamKey) -> Option<SubSession> {
        self.subs.remove(key)
    }
}

struct StreamHandle {
    token: CancellationToken,
    stream_id: u64,
}

/// Owns the cancellation token for each in-flight sub-session, keyed by
/// `(conversation, instance index)`. Taking ownership of a key atomically
/// cancels whatever was streaming there before, which is what guarantees at
/// most one in-flight request per model slot per conversation.
#[derive(Default)]
pub struct ControllerRegistry {
    entries: HashMap<StreamKey, StreamHandle>,
    next_stream_id: u64,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and replace any prior entry under `key`; returns the fresh
    /// token and the stream id that makes older events for this key stale.
    pub fn assume_ownership(&mut self, key: StreamKey) -> (CancellationToken, u64) {
        if let Some(prior) = self.entries.remove(&key) {
            prior.token.cancel();
        }

        self.next_stream_id += 1;
        let token = CancellationToken::new();
        self.entries.insert(
            key,
            StreamHandle {
                token: token.clone(),
                stream_id: self.next_stream_id,
            },
        );
        (token, self.next_stream_id)
    }

    /// Whether an event still belongs to the stream that currently owns its
    /// key. Events from cancelled or superseded spawns fail this check.
    pub fn is_current(&self, tag: &StreamTag) -> bool {
        self.entries
            .get(&tag.key)
            .map(|handle| handle.stream_id == tag.stream_id)
            .unwrap_or(false)
    }

    /// Cancel one sub-session. Siblings keep streaming.
    pub fn cancel(&mut self, key: &StreamKey) -> bool {
        match self.entries.remove(key) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.entries.drain() {
            handle.token.cancel();
        }
    }

    /// Drop the registration after a terminal event, without cancelling.
    pub fn release(&mut self, tag: &StreamTag) {
        if self.is_current(tag) {
            self.entries.remove(&tag.key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}
