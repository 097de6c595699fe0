//! Chat front end: long-polls Telegram and routes messages.

mod commands;
mod reddit;

pub use commands::{Command, help_text, render_stats, start_text};
pub use reddit::{MediaFilter, RedditClient, RedditError, RedditMedia, RedditPost};

use std::sync::Arc;
use std::time::{Duration, Instant};

use media_providers::adapter::Credentials;
use media_providers::{ClassifiedLink, FailureKind, LinkClassifier, MediaKind, ProviderTag};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::BotConfig;
use crate::orchestrator::{ChatKind, DeliveryTarget, Orchestrator, Request};
use crate::recorder::{JsonStatsRecorder, UsageContext, UsageOutcome, UsageRecord, UsageRecorder};
use crate::telegram::{MediaSource, Message, TelegramClient, Update};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Everything the bot needs besides its own configuration.
pub struct BotDeps {
    pub client: Arc<TelegramClient>,
    pub orchestrator: Orchestrator,
    pub classifier: Arc<LinkClassifier>,
    pub reddit: RedditClient,
    pub stats: JsonStatsRecorder,
    pub credentials: Arc<Credentials>,
}

pub struct Bot {
    config: BotConfig,
    deps: BotDeps,
}

impl Bot {
    pub fn new(config: BotConfig, deps: BotDeps) -> Self {
        Self { config, deps }
    }

    /// Poll for updates until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut offset = 0;
        info!(target_group = ?self.config.target_group_id, "bot polling started");
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.deps.client.get_updates(offset, self.config.poll_timeout_secs) => polled,
            };
            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("bot polling stopped");
        Ok(())
    }

    async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        if !self.accepts_chat(&message) {
            debug!(chat_id = message.chat.id, "ignoring message from non-target group");
            return;
        }
        if message.from.as_ref().is_some_and(|u| u.is_bot) {
            return;
        }
        let Some(text) = message.text_or_caption() else {
            return;
        };
        match Command::parse(text) {
            Some(command) => self.handle_command(&message, command).await,
            None => self.handle_links(&message, text),
        }
    }

    fn accepts_chat(&self, message: &Message) -> bool {
        match (message.chat_kind(), self.config.target_group_id) {
            (ChatKind::Group, Some(target)) => message.chat.id == target,
            _ => true,
        }
    }

    fn handle_links(&self, message: &Message, text: &str) {
        let links = self.deps.classifier.classify(text);
        if links.is_empty() {
            return;
        }
        let request = Request::new(delivery_target(message), text, links);
        let handles = self.deps.orchestrator.submit(&request);
        info!(
            chat_id = message.chat.id,
            message_id = message.message_id,
            jobs = handles.len(),
            "links submitted"
        );
    }

    async fn handle_command(&self, message: &Message, command: Command) {
        let chat_id = message.chat.id;
        debug!(chat_id, ?command, "command received");
        match command {
            Command::Start => self.reply(message, start_text(message.chat_kind())).await,
            Command::Help => self.reply(message, &help_text(self.config.owner_id.is_some())).await,
            Command::Usage(usage) => self.reply(message, usage).await,
            Command::Stats => self.stats(message).await,
            Command::Stories { username } => self.stories(message, &username).await,
            Command::Reddit {
                subreddit,
                time_range,
                filter,
            } => self.reddit(message, &subreddit, time_range.as_deref(), filter).await,
            Command::Suggestion(text) => self.suggestion(message, &text).await,
            Command::Cancel => self.cancel(message).await,
            Command::Unknown(name) => debug!(chat_id, command = %name, "unknown command"),
        }
    }

    async fn stats(&self, message: &Message) {
        let sender = message.from.as_ref().map(|u| u.id);
        if self.config.owner_id.is_some() && sender != self.config.owner_id {
            debug!(?sender, "ignoring /stats from non-owner");
            return;
        }
        self.record(message, UsageContext::StatsCommand, None, UsageOutcome::Handled, Duration::ZERO);
        let text = render_stats(&self.deps.stats.snapshot());
        self.reply(message, &text).await;
    }

    async fn stories(&self, message: &Message, username: &str) {
        let url = format!("https://instagram.com/stories/{username}");
        if !self.deps.credentials.has(ProviderTag::Instagram) {
            warn!(username, "stories requested without an Instagram session");
            self.record(
                message,
                UsageContext::StoryCommand,
                Some(ProviderTag::Instagram),
                UsageOutcome::Failed(FailureKind::AuthRequired),
                Duration::ZERO,
            );
            let notice = FailureKind::AuthRequired.user_message(ProviderTag::Instagram);
            self.reply(message, &notice).await;
            return;
        }
        let link = self.deps.classifier.classify_one(&url).unwrap_or(ClassifiedLink {
            provider: ProviderTag::Instagram,
            url,
            alias: false,
        });
        let request = Request::new(delivery_target(message), format!("/stories {username}"), vec![link])
            .with_context(UsageContext::StoryCommand);
        self.deps.orchestrator.submit(&request);
        self.reply(message, &format!("Fetching stories for '{username}'...")).await;
    }

    async fn reddit(&self, message: &Message, subreddit: &str, time_range: Option<&str>, filter: MediaFilter) {
        let started = Instant::now();
        let kind = message.chat_kind();
        let context = match kind {
            ChatKind::Private => UsageContext::RedditCommandPrivate,
            ChatKind::Group => UsageContext::RedditCommandGroup,
        };
        if kind == ChatKind::Group
            && let Err(e) = self.deps.client.delete_message(message.chat.id, message.message_id).await
        {
            debug!(error = %e, "could not delete /reddit command message");
        }

        let post = match self.deps.reddit.random_media(subreddit, time_range, filter).await {
            Ok(post) => post,
            Err(e) => {
                warn!(subreddit, error = %e, "reddit lookup failed");
                self.record(message, context, Some(ProviderTag::Reddit), UsageOutcome::Failed(FailureKind::NotFound), started.elapsed());
                self.send(message, &crate::telegram::escape_html(&e.to_string())).await;
                return;
            }
        };

        match post.media {
            RedditMedia::Image(image_url) => {
                let caption = format!(
                    "<a href=\"{}\">{}</a>",
                    post.permalink,
                    crate::telegram::escape_html(&post.title)
                );
                let sent = self
                    .deps
                    .client
                    .send_media(
                        message.chat.id,
                        MediaKind::Image,
                        MediaSource::Url(&image_url),
                        Some(&caption),
                        reply_to(message),
                    )
                    .await;
                let outcome = match sent {
                    Ok(_) => UsageOutcome::Succeeded,
                    Err(e) => {
                        warn!(url = %image_url, error = %e, "failed to send reddit image");
                        self.send(message, "Found a post but could not send the image.").await;
                        UsageOutcome::Failed(FailureKind::DeliveryError)
                    }
                };
                self.record(message, context, Some(ProviderTag::Reddit), outcome, started.elapsed());
            }
            RedditMedia::Video => {
                let link = self.deps.classifier.classify_one(&post.permalink).unwrap_or(ClassifiedLink {
                    provider: ProviderTag::Reddit,
                    url: post.permalink.clone(),
                    alias: false,
                });
                let request = Request::new(delivery_target(message), format!("/reddit {subreddit}"), vec![link])
                    .with_context(context);
                self.deps.orchestrator.submit(&request);
            }
        }
    }

    async fn suggestion(&self, message: &Message, text: &str) {
        if message.chat_kind() != ChatKind::Private {
            return;
        }
        let Some(owner) = self.config.owner_id else {
            self.reply(message, "Sorry, the suggestion feature is not configured by the bot owner.").await;
            return;
        };
        let from = message
            .from
            .as_ref()
            .map(|u| format!("{} (<code>{}</code>)", crate::telegram::escape_html(&u.display_name()), u.id))
            .unwrap_or_else(|| "unknown".to_string());
        let forwarded = format!(
            "📬 <b>Suggestion Received</b>\n\n<b>From:</b> {from}\n\n<pre>{}</pre>",
            crate::telegram::escape_html(text)
        );
        match self.deps.client.send_message(owner, &forwarded, None).await {
            Ok(_) => self.reply(message, "✅ Thank you! Your suggestion has been sent to the bot owner.").await,
            Err(e) => {
                warn!(error = %e, "failed to forward suggestion");
                self.reply(message, "❌ Could not send the suggestion. Please try again later.").await;
            }
        }
    }

    async fn cancel(&self, message: &Message) {
        let Some(original) = message.reply_to_message.as_deref() else {
            self.reply(message, "Reply to the message with the link you want to cancel.").await;
            return;
        };
        let withdrawn = self
            .deps
            .orchestrator
            .cancel_message(message.chat.id, original.message_id);
        let text = if withdrawn > 0 {
            "Cancelled."
        } else {
            "Nothing to cancel for that message."
        };
        self.reply(message, text).await;
    }

    fn record(
        &self,
        message: &Message,
        context: UsageContext,
        provider: Option<ProviderTag>,
        outcome: UsageOutcome,
        duration: Duration,
    ) {
        self.deps.stats.record(UsageRecord {
            chat_id: message.chat.id,
            user_id: message.from.as_ref().map(|u| u.id),
            context,
            provider,
            outcome,
            duration,
        });
    }

    async fn reply(&self, message: &Message, text: &str) {
        if let Err(e) = self
            .deps
            .client
            .send_message(message.chat.id, text, Some(message.message_id))
            .await
        {
            warn!(chat_id = message.chat.id, error = %e, "failed to reply");
        }
    }

    /// Message the chat without quoting, for replies to deleted commands.
    async fn send(&self, message: &Message, text: &str) {
        if let Err(e) = self
            .deps
            .client
            .send_message(message.chat.id, text, reply_to(message))
            .await
        {
            warn!(chat_id = message.chat.id, error = %e, "failed to send message");
        }
    }
}

fn reply_to(message: &Message) -> Option<i64> {
    match message.chat_kind() {
        ChatKind::Private => Some(message.message_id),
        ChatKind::Group => None,
    }
}

fn delivery_target(message: &Message) -> DeliveryTarget {
    DeliveryTarget {
        chat_id: message.chat.id,
        message_id: message.message_id,
        chat_kind: message.chat_kind(),
        sender_id: message.from.as_ref().map(|u| u.id),
        sender_name: message.from.as_ref().map(|u| u.display_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(raw: serde_json::Value) -> Message {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn delivery_target_uses_sender() {
        let msg = message(serde_json::json!({
            "message_id": 12,
            "chat": {"id": -100, "type": "group"},
            "from": {"id": 5, "first_name": "Ana", "last_name": "Lee"},
            "text": "hi"
        }));
        let target = delivery_target(&msg);
        assert_eq!(target.chat_kind, ChatKind::Group);
        assert_eq!(target.sender_id, Some(5));
        assert_eq!(target.sender_name.as_deref(), Some("Ana Lee"));
        assert_eq!(reply_to(&msg), None);
    }
}
