//! Telegram notification transport.
//!
//! Implements the core's [`Notifier`] interface over the Telegram Bot API
//! using the teloxide client. Sends are fire-and-forget: each one is
//! spawned onto the runtime and failures are logged and dropped, never
//! surfaced to the tick loop.

use autopilot_core::{Notifier, TelegramConfig};
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use tracing::{debug, warn};

/// One-way Telegram notifier.
pub struct TelegramNotifier {
    bot: teloxide::Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: teloxide::Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }

    pub fn from_config(cfg: &TelegramConfig) -> Self {
        Self::new(&cfg.bot_token, cfg.chat_id)
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, text: &str) {
        let bot = self.bot.clone();
        let chat_id = self.chat_id;
        let text = text.to_string();
        // Must not block the caller; delivery failures are dropped.
        tokio::spawn(async move {
            match bot.send_message(chat_id, &text).await {
                Ok(_) => debug!(chars = text.len(), "telegram notification sent"),
                Err(e) => warn!(error = %e, "telegram notification dropped"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_from_config() {
        let cfg = TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_id: 42,
        };
        let notifier = TelegramNotifier::from_config(&cfg);
        assert_eq!(notifier.chat_id, ChatId(42));
    }
}
