use std::collections::HashSet;

use crate::core::message::{GroupKey, Message};

/// All generations (time-ordered alternative answers) for one question from
/// one model slot.
#[derive(Debug, Clone)]
pub struct GenerationGroup {
    pub key: GroupKey,
    pub generations: Vec<Message>,
}

impl GenerationGroup {
    /// Index of a generation by message id, if it is still in the group.
    pub fn position_of(&self, message_id: &str) -> Option<usize> {
        self.generations.iter().position(|m| m.id == message_id)
    }

    /// The default current view: the most recent generation.
    pub fn latest(&self) -> Option<&Message> {
        self.generations.last()
    }
}

/// One user question together with its per-slot generation groups, in the
/// order the slots first answered.
#[derive(Debug, Clone)]
pub struct QuestionGroup {
    pub question: Message,
    pub groups: Vec<GenerationGroup>,
}

/// Owns the message list for the active conversation plus the grouped view
/// derived from it. The grouped view is recomputed explicitly after each
/// mutation rather than reactively.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    groups: Vec<QuestionGroup>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn groups(&self) -> &[QuestionGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.recompute_groups();
    }

    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recompute_groups();
    }

    /// Mutate the message with the given id in place. Returns false if no
    /// such message exists.
    pub fn patch<F>(&mut self, id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let patched = match self.messages.iter_mut().find(|m| m.id == id) {
            Some(msg) => {
                apply(msg);
                true
            }
            None => false,
        };
        if patched {
            self.recompute_groups();
        }
        patched
    }

    /// Swap a locally generated id for the authoritative one returned by the
    /// message API, keeping the message's position in the list.
    pub fn adopt_id(&mut self, local_id: &str, saved_id: &str) -> bool {
        let adopted = match self.messages.iter_mut().find(|m| m.id == local_id) {
            Some(msg) => {
                msg.id = saved_id.to_string();
                true
            }
            None => false,
        };
        if adopted {
            self.recompute_groups();
        }
        adopted
    }

    /// Remove a message outright (e.g. an abandoned retry placeholder).
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        let removed = self.messages.remove(index);
        self.recompute_groups();
        Some(removed)
    }

    /// Resolve the user message an assistant message answers: the explicit
    /// parent id when present, otherwise the nearest preceding user message
    /// in turn order. `None` means the message is an orphan.
    pub fn resolve_parent_id(&self, assistant_index: usize) -> Option<String> {
        let msg = self.messages.get(assistant_index)?;
        if !msg.is_assistant() {
            return None;
        }
        if let Some(parent_id) = &msg.parent_message_id {
            return Some(parent_id.clone());
        }
        self.messages[..assistant_index]
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.id.clone())
    }

    /// Assistant messages that resolve to no user message. They stay in the
    /// list but are excluded from the grouped view.
    pub fn orphans(&self) -> Vec<&Message> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_assistant())
            .filter(|(i, _)| {
                let resolved = self.resolve_parent_id(*i);
                match resolved {
                    Some(parent_id) => !self
                        .messages
                        .iter()
                        .any(|m| m.is_user() && m.id == parent_id),
                    None => true,
                }
            })
            .map(|(_, m)| m)
            .collect()
    }

    /// Rebuild the question/model grouped view from the flat message list.
    pub fn recompute_groups(&mut self) {
        self.groups = group_by_question_and_model(&self.messages);
    }

    pub fn find_group(&self, key: &GroupKey) -> Option<&GenerationGroup> {
        self.groups
            .iter()
            .flat_map(|q| q.groups.iter())
            .find(|g| &g.key == key)
    }

    pub fn latest_question(&self) -> Option<&QuestionGroup> {
        self.groups.last()
    }
}

/// Identity used to collapse double-submitted assistant messages: same
/// provider, wire format, model, and content. Instance index deliberately
/// excluded.
fn dedup_key(message: &Message) -> (String, String, String, String) {
    (
        message.provider_name.clone(),
        message.api_format.clone(),
        message.model.clone(),
        message.content.clone(),
    )
}

/// Drop assistant messages that duplicate an earlier one under the dedup
/// identity, keeping the first occurrence. User messages pass through.
pub fn dedupe_messages(messages: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::new();
    messages
        .iter()
        .filter(|m| !m.is_assistant() || seen.insert(dedup_key(m)))
        .cloned()
        .collect()
}

/// Partition assistant messages under their resolved parent user message,
/// then sub-partition each question's answers by model slot. Generations
/// within a slot are ordered by creation time ascending.
pub fn group_by_question_and_model(messages: &[Message]) -> Vec<QuestionGroup> {
    let deduped = dedupe_messages(messages);

    let mut questions: Vec<QuestionGroup> = Vec::new();
    for msg in deduped.iter().filter(|m| m.is_user()) {
        questions.push(QuestionGroup {
            question: msg.clone(),
            groups: Vec::new(),
        });
    }

    for (index, msg) in deduped.iter().enumerate() {
        if !msg.is_assistant() {
            continue;
        }
        let parent_id = match resolve_parent_in(&deduped, index) {
            Some(id) => id,
            None => continue,
        };
        let question = match questions.iter_mut().find(|q| q.question.id == parent_id) {
            Some(question) => question,
            // Explicit parent id pointing outside the list: orphan.
            None => continue,
        };
        let key = GroupKey::new(parent_id, msg.slot());
        match question.groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.generations.push(msg.clone()),
            None => question.groups.push(GenerationGroup {
                key,
                generations: vec![msg.clone()],
            }),
        }
    }

    for question in &mut questions {
        for group in &mut question.groups {
            group.generations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
    }

    questions
}

fn resolve_parent_in(messages: &[Message], assistant_index: usize) -> Option<String> {
    let msg = &messages[assistant_index];
    if let Some(parent_id) = &msg.parent_message_id {
        return Some(parent_id.clone());
    }
    messages[..assistant_index]
        .iter()
        .rev()
        .find(|m| m.is_user())
        .map(|m| m.id.clone())
}
