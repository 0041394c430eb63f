//! Persistence layer: forwarding rules and last-seen ids as JSON files.

pub mod json;
pub mod last_seen;
pub mod rules;

pub use json::JsonStore;
pub use last_seen::LastSeenIds;
pub use rules::RuleBook;
