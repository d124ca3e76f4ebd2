//! Ensemble is the streaming orchestration core of a chat client for a
//! multi-provider LLM gateway: it fans one user prompt out to several model
//! backends at once, accumulates each backend's streaming answer
//! independently, supports retrying any single answer while keeping every
//! prior generation navigable, and reconciles that transient client state
//! against the gateway's persisted message list.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the domain logic: the message store and its
//!   question/model grouping, per-slot streaming sub-sessions with
//!   independent cancellation, generation navigation, reconciliation, and
//!   the [`core::controller::ChatController`] facade that ties them
//!   together.
//! - [`api`] defines the gateway wire payloads and the REST message client.
//! - [`utils`] holds endpoint construction, client-side id generation, and
//!   the durable key-value store backing navigation state.
//!
//! Rendering, authentication, and the gateway's own persistence are out of
//! scope; they plug in through the [`core::chat_stream::ChatTransport`],
//! [`api::MessageApi`], and [`utils::kv::KeyValueStore`] seams.

pub mod api;
pub mod core;
pub mod utils;

pub use crate::core::controller::{ChangeNotice, ChatController};
pub use crate::core::message::{GroupKey, Message, ModelSlot, Role};
pub use crate::core::navigation::NavigationDirection;
pub use crate::core::session::SessionError;
