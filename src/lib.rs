//! Relay Forward: rule-driven auto-forwarding between chats.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
