//! Telegram bot client - long polling via teloxide.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, MessageId, ReplyParameters};

use crate::error::Error;
use crate::hub::Hub;

use super::messenger::{split_message, InboundMessage, Messenger, MAX_MESSAGE_CHARS};

/// [`Messenger`] backed by the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), Error> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.bot
                .send_message(ChatId(chat_id), chunk)
                .await
                .map_err(|e| Error::Telegram(e.to_string()))?;
        }
        Ok(())
    }

    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<(), Error> {
        let chat_id = ChatId(to.chat_id);
        for (i, chunk) in split_message(text, MAX_MESSAGE_CHARS).into_iter().enumerate() {
            let request = self.bot.send_message(chat_id, chunk);
            let request = if i == 0 {
                request.reply_parameters(ReplyParameters::new(MessageId(to.message_id)))
            } else {
                request
            };
            request
                .await
                .map_err(|e| Error::Telegram(e.to_string()))?;
        }
        Ok(())
    }
}

/// Convert a Telegram message into an [`InboundMessage`]; `None` for
/// messages without text or sender.
pub fn inbound_from(msg: &Message) -> Option<InboundMessage> {
    let text = msg.text()?.to_string();
    let from = msg.from.as_ref()?;
    let sender = from
        .username
        .clone()
        .unwrap_or_else(|| from.id.0.to_string());

    Some(InboundMessage {
        sender,
        chat_id: msg.chat.id.0,
        message_id: msg.id.0,
        is_group: !msg.chat.is_private(),
        text,
    })
}

/// Consume the bot's update stream, handing each message to the hub.
pub async fn run_poll_loop(messenger: TelegramMessenger, hub: Arc<Hub>) -> Result<(), Error> {
    let bot = messenger.bot().clone();

    match bot.get_me().await {
        Ok(me) => tracing::info!("Bot started as @{}", me.username()),
        Err(e) => return Err(Error::Telegram(format!("bot login failed: {}", e))),
    }

    if let Err(e) = bot
        .set_my_commands(vec![BotCommand::new("help", "Show help")])
        .await
    {
        tracing::warn!("Failed to set commands: {}", e);
    }

    teloxide::repl(bot, move |msg: Message| {
        let hub = Arc::clone(&hub);
        async move {
            match inbound_from(&msg) {
                Some(inbound) => hub.handle_message(inbound).await,
                None => tracing::debug!("Ignoring non-text update in chat {}", msg.chat.id),
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
