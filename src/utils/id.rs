//! Client-side temporary message ids.
//!
//! Optimistic messages get a local id until the gateway returns the
//! authoritative one; reconciliation uses the prefix to tell the two apart.

use uuid::Uuid;

const LOCAL_PREFIX: &str = "local-";

/// Generate a temporary id for a message that has not been persisted yet.
pub fn local_message_id() -> String {
    format!("{LOCAL_PREFIX}{}", Uuid::new_v4())
}

/// Whether an id was generated client-side and is not authoritative.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}
