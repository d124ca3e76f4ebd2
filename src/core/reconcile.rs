use tracing::debug;

use crate::core::chat_stream::StreamKey;
use crate::core::message::{Message, ModelSlot};
use crate::core::store::{dedupe_messages, group_by_question_and_model};

/// Result of merging the authoritative server list with local state.
///
/// `messages` is `None` when the merge was skipped because a sub-session is
/// still streaming — replacing the list mid-stream would visually truncate
/// live output. `default_selections` is always recomputed.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub messages: Option<Vec<Message>>,
    pub default_selections: Vec<ModelSlot>,
}

/// Merge the server message list with local optimistic/streaming state.
///
/// Server messages are ground truth; assistant duplicates are collapsed by
/// the store's dedup rule; purely local messages (ids the server does not
/// know, e.g. client-generated temporaries awaiting a save) are re-attached
/// so nothing visible disappears while a write is in flight.
pub fn reconcile(
    local: &[Message],
    server: &[Message],
    active_streaming_keys: &[StreamKey],
    force: bool,
) -> ReconcileOutcome {
    if !active_streaming_keys.is_empty() && !force {
        debug!(
            active = active_streaming_keys.len(),
            "skipping message merge while streaming"
        );
        return ReconcileOutcome {
            messages: None,
            default_selections: derive_default_selections(server),
        };
    }

    let mut merged = dedupe_messages(server);
    let server_ids: std::collections::HashSet<&str> =
        server.iter().map(|m| m.id.as_str()).collect();

    for msg in local {
        if !server_ids.contains(msg.id.as_str()) {
            merged.push(msg.clone());
        }
    }

    // A locally re-attached assistant may itself duplicate a server row that
    // finished saving between the list fetch and now.
    let merged = dedupe_messages(&merged);
    let default_selections = derive_default_selections(&merged);

    ReconcileOutcome {
        messages: Some(merged),
        default_selections,
    }
}

/// Infer which model slots should be pre-selected from the newest question:
/// a conversation that only ever used one slot follows that slot's latest
/// retry; a multi-slot conversation selects the latest generation's slot for
/// each distinct slot. Inferred from data shape, not a stored flag.
pub fn derive_default_selections(messages: &[Message]) -> Vec<ModelSlot> {
    let grouped = group_by_question_and_model(messages);
    let Some(latest_question) = grouped.last() else {
        return Vec::new();
    };
    latest_question
        .groups
        .iter()
        .map(|g| g.key.slot.clone())
        .collect()
}
