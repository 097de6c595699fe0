//! Telegram Bot API transport.

mod client;
mod delivery;
mod types;

pub use client::{MediaSource, TelegramClient};
pub use delivery::TelegramDelivery;
pub(crate) use delivery::escape_html;
pub use types::{ApiResponse, Chat, FileRef, Message, PhotoSize, ResponseParameters, Update, User};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Bot API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("rate limit exceeded after {0} retries")]
    RateLimited(u32),

    #[error("Bot API returned no result for {0}")]
    EmptyResult(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelegramError {
    /// Deleting an already deleted message is not worth a warning.
    pub fn is_message_gone(&self) -> bool {
        matches!(self, TelegramError::Api { description, .. }
            if description.to_lowercase().contains("message to delete not found"))
    }
}
