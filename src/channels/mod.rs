//! Platform channels: inbound polling and outbound delivery.

pub mod directory;
pub mod telegram;

pub use directory::CachedAuthorDirectory;
pub use telegram::{TelegramApi, TelegramSender, spawn_poller};
