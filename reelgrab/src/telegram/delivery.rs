use std::sync::Arc;

use async_trait::async_trait;
use media_providers::{MediaArtifact, ProviderTag};
use tracing::{debug, info, warn};

use super::client::{MediaSource, TelegramClient};
use crate::delivery::{Delivery, DeliveryError, DeliveryPayload, DeliveryReceipt, ReceiptItem, artifact_items};
use crate::orchestrator::{ChatKind, DeliveryTarget, JobFailure};

/// Delivers artifacts to Telegram chats.
///
/// Private chats get the media as a reply. In groups the media is captioned
/// with the sender and the original message is deleted afterwards.
pub struct TelegramDelivery {
    client: Arc<TelegramClient>,
    max_upload_bytes: u64,
}

impl TelegramDelivery {
    pub fn new(client: Arc<TelegramClient>, max_upload_bytes: u64) -> Self {
        Self {
            client,
            max_upload_bytes,
        }
    }

    fn check_size(&self, artifact: &MediaArtifact) -> Result<(), DeliveryError> {
        let largest = match artifact {
            MediaArtifact::Collection { items, .. } => items.iter().map(|i| i.size_bytes).max().unwrap_or(0),
            other => other.size_bytes(),
        };
        if largest > self.max_upload_bytes {
            return Err(DeliveryError::TooLarge {
                size: largest,
                limit: self.max_upload_bytes,
            });
        }
        Ok(())
    }

    async fn upload(
        &self,
        target: &DeliveryTarget,
        artifact: &MediaArtifact,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.check_size(artifact)?;
        let caption = group_caption(target);
        let reply_to = reply_to(target);
        let mut receipt = DeliveryReceipt::default();
        for (index, (kind, path)) in artifact_items(artifact).into_iter().enumerate() {
            let caption = if index == 0 { caption.as_deref() } else { None };
            let sent = self
                .client
                .send_media(target.chat_id, kind, MediaSource::File(path), caption, reply_to)
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            let Some(file_id) = sent.file_id() else {
                return Err(DeliveryError::Transport("sent message carries no file".into()));
            };
            receipt.items.push(ReceiptItem {
                kind,
                file_ref: file_id.to_string(),
            });
        }
        if receipt.is_empty() {
            return Err(DeliveryError::Empty);
        }
        Ok(receipt)
    }

    async fn resend(
        &self,
        target: &DeliveryTarget,
        earlier: &DeliveryReceipt,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let caption = group_caption(target);
        let reply_to = reply_to(target);
        for (index, item) in earlier.items.iter().enumerate() {
            let caption = if index == 0 { caption.as_deref() } else { None };
            self.client
                .send_media(target.chat_id, item.kind, MediaSource::FileId(&item.file_ref), caption, reply_to)
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        }
        Ok(earlier.clone())
    }

    async fn remove_original(&self, target: &DeliveryTarget) {
        match self.client.delete_message(target.chat_id, target.message_id).await {
            Ok(_) => debug!(chat_id = target.chat_id, message_id = target.message_id, "original message deleted"),
            Err(e) if e.is_message_gone() => {
                info!(message_id = target.message_id, "original message already deleted")
            }
            Err(e) => warn!(
                chat_id = target.chat_id,
                message_id = target.message_id,
                error = %e,
                "failed to delete original message"
            ),
        }
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        payload: DeliveryPayload<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let receipt = match payload {
            DeliveryPayload::Upload(artifact) => self.upload(target, artifact).await?,
            DeliveryPayload::Reuse(earlier) => self.resend(target, earlier).await?,
        };
        if target.chat_kind == ChatKind::Group {
            self.remove_original(target).await;
        }
        Ok(receipt)
    }

    async fn report_failure(&self, target: &DeliveryTarget, provider: ProviderTag, failure: &JobFailure) {
        let text = format!("⚠️ {}", escape_html(&failure.message));
        if let Err(e) = self
            .client
            .send_message(target.chat_id, &text, Some(target.message_id))
            .await
        {
            warn!(chat_id = target.chat_id, %provider, error = %e, "failed to send failure notice");
        }
    }
}

fn reply_to(target: &DeliveryTarget) -> Option<i64> {
    match target.chat_kind {
        ChatKind::Private => Some(target.message_id),
        ChatKind::Group => None,
    }
}

fn group_caption(target: &DeliveryTarget) -> Option<String> {
    match (target.chat_kind, &target.sender_name) {
        (ChatKind::Group, Some(name)) => Some(format!("Sent by {}", escape_html(name))),
        _ => None,
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_providers::{MediaItem, MediaKind};

    fn target(kind: ChatKind) -> DeliveryTarget {
        DeliveryTarget {
            chat_id: 1,
            message_id: 2,
            chat_kind: kind,
            sender_id: Some(3),
            sender_name: Some("<sam>".into()),
        }
    }

    fn delivery(limit: u64) -> TelegramDelivery {
        let client = TelegramClient::new("http://127.0.0.1:9", "t").unwrap();
        TelegramDelivery::new(Arc::new(client), limit)
    }

    #[test]
    fn replies_only_in_private_chats() {
        assert_eq!(reply_to(&target(ChatKind::Private)), Some(2));
        assert_eq!(reply_to(&target(ChatKind::Group)), None);
    }

    #[test]
    fn group_caption_escapes_sender() {
        assert_eq!(group_caption(&target(ChatKind::Group)).unwrap(), "Sent by &lt;sam&gt;");
        assert!(group_caption(&target(ChatKind::Private)).is_none());
    }

    #[test]
    fn oversize_video_is_rejected() {
        let artifact = MediaArtifact::Video {
            path: "v.mp4".into(),
            size_bytes: 60 * 1024 * 1024,
        };
        let err = delivery(50 * 1024 * 1024).check_size(&artifact).unwrap_err();
        assert!(matches!(err, DeliveryError::TooLarge { .. }));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn collection_limit_applies_per_item() {
        let item = |size| MediaItem {
            path: "x.jpg".into(),
            kind: MediaKind::Image,
            size_bytes: size,
        };
        let artifact = MediaArtifact::Collection {
            items: vec![item(40), item(40)],
            size_bytes: 80,
        };
        assert!(delivery(50).check_size(&artifact).is_ok());
    }
}
