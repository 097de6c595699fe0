//! Hand-off of finished artifacts to a chat (or anywhere else).

mod local;

pub use local::LocalDirDelivery;

use async_trait::async_trait;
use media_providers::{MediaArtifact, MediaKind, ProviderTag};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::{DeliveryTarget, JobFailure};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("nothing to deliver")]
    Empty,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to send: a fresh artifact, or a reference to an earlier upload.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryPayload<'a> {
    Upload(&'a MediaArtifact),
    Reuse(&'a DeliveryReceipt),
}

/// One delivered file as the transport knows it (a Telegram `file_id`, a
/// copied path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub kind: MediaKind,
    pub file_ref: String,
}

/// Proof of a completed delivery; lets later recipients reuse the upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub items: Vec<ReceiptItem>,
}

impl DeliveryReceipt {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outbound side of the pipeline.
///
/// Implementations own transport concerns, including removal of the
/// originating message in group chats once a delivery succeeded.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        payload: DeliveryPayload<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Tell the chat a job failed. Errors are logged, never returned.
    async fn report_failure(&self, target: &DeliveryTarget, provider: ProviderTag, failure: &JobFailure);
}

/// Files of an artifact in send order, with their kinds.
pub(crate) fn artifact_items(artifact: &MediaArtifact) -> Vec<(MediaKind, &std::path::Path)> {
    match artifact {
        MediaArtifact::Video { path, .. } => vec![(MediaKind::Video, path.as_path())],
        MediaArtifact::ImageSequence { images, .. } => images
            .iter()
            .map(|p| (MediaKind::Image, p.as_path()))
            .collect(),
        MediaArtifact::Collection { items, .. } => items
            .iter()
            .map(|i| (i.kind, i.path.as_path()))
            .collect(),
    }
}
