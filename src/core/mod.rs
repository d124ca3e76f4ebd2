pub mod chat_stream;
pub mod config;
pub mod controller;
pub mod message;
pub mod navigation;
pub mod reconcile;
pub mod session;
pub mod store;
