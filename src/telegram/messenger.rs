//! Chat-platform seam: what the hub needs to send, and what it receives.

use async_trait::async_trait;

use crate::error::Error;

/// Telegram rejects messages above 4096 characters; stay below it.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// A text message observed on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender's user name (or numeric id when the account has none).
    pub sender: String,
    pub chat_id: i64,
    pub message_id: i32,
    /// Sent from a group, supergroup or channel rather than a private chat.
    pub is_group: bool,
    pub text: String,
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `text` to a chat.
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), Error>;

    /// Reply to `to` in its own chat.
    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<(), Error>;
}

/// Messenger used when no bot token is configured: every send fails, so
/// deliveries end up queued.
pub struct OfflineMessenger;

#[async_trait]
impl Messenger for OfflineMessenger {
    async fn send(&self, _chat_id: i64, _text: &str) -> Result<(), Error> {
        Err(Error::Telegram("no bot token configured".to_string()))
    }

    async fn reply(&self, _to: &InboundMessage, _text: &str) -> Result<(), Error> {
        Err(Error::Telegram("no bot token configured".to_string()))
    }
}

/// Split `text` into chunks of at most `max` characters, preferring line breaks.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max {
            for ch in line.chars() {
                if current_len == max {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += 1;
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn splits_on_lines_and_keeps_everything() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = split_message(text, 10);

        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn long_line_is_cut_on_char_boundaries() {
        let text = "ééééééé";
        let chunks = split_message(text, 3);

        assert_eq!(chunks, vec!["ééé", "ééé", "é"]);
    }
}
