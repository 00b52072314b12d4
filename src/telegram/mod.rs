//! Telegram bot integration.

pub mod client;
pub mod messenger;

pub use client::{run_poll_loop, TelegramMessenger};
pub use messenger::{InboundMessage, Messenger, OfflineMessenger};
