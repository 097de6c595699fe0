use std::path::{Path, PathBuf};

use async_trait::async_trait;
use media_providers::ProviderTag;
use tracing::{info, warn};

use super::{Delivery, DeliveryError, DeliveryPayload, DeliveryReceipt, ReceiptItem, artifact_items};
use crate::orchestrator::{DeliveryTarget, JobFailure};

/// Copies artifacts into a directory. Backs the `fetch` subcommand.
#[derive(Debug, Clone)]
pub struct LocalDirDelivery {
    out_dir: PathBuf,
}

impl LocalDirDelivery {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn destination(&self, target: &DeliveryTarget, index: usize, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        self.out_dir
            .join(format!("{}-{}-{index:02}-{name}", target.chat_id, target.message_id))
    }
}

#[async_trait]
impl Delivery for LocalDirDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        payload: DeliveryPayload<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        tokio::fs::create_dir_all(&self.out_dir).await?;
        match payload {
            DeliveryPayload::Upload(artifact) => {
                let mut receipt = DeliveryReceipt::default();
                for (index, (kind, source)) in artifact_items(artifact).into_iter().enumerate() {
                    let dest = self.destination(target, index, source);
                    tokio::fs::copy(source, &dest).await?;
                    info!(path = %dest.display(), "saved");
                    receipt.items.push(ReceiptItem {
                        kind,
                        file_ref: dest.display().to_string(),
                    });
                }
                if receipt.is_empty() {
                    return Err(DeliveryError::Empty);
                }
                Ok(receipt)
            }
            // Already on disk; the earlier copies are the result.
            DeliveryPayload::Reuse(receipt) => Ok(receipt.clone()),
        }
    }

    async fn report_failure(&self, target: &DeliveryTarget, provider: ProviderTag, failure: &JobFailure) {
        warn!(
            chat_id = target.chat_id,
            %provider,
            kind = %failure.kind,
            detail = %failure.detail,
            "{}",
            failure.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ChatKind;
    use media_providers::{MediaArtifact, MediaItem, MediaKind};

    fn target() -> DeliveryTarget {
        DeliveryTarget {
            chat_id: 5,
            message_id: 9,
            chat_kind: ChatKind::Private,
            sender_id: None,
            sender_name: None,
        }
    }

    #[tokio::test]
    async fn copies_each_collection_item() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let a = src.path().join("a.jpg");
        let b = src.path().join("b.mp4");
        std::fs::write(&a, vec![1u8; 200]).unwrap();
        std::fs::write(&b, vec![2u8; 300]).unwrap();
        let artifact = MediaArtifact::Collection {
            items: vec![
                MediaItem { path: a, kind: MediaKind::Image, size_bytes: 200 },
                MediaItem { path: b, kind: MediaKind::Video, size_bytes: 300 },
            ],
            size_bytes: 500,
        };

        let delivery = LocalDirDelivery::new(out.path().join("saved"));
        let receipt = delivery
            .deliver(&target(), DeliveryPayload::Upload(&artifact))
            .await
            .unwrap();

        assert_eq!(receipt.items.len(), 2);
        assert_eq!(receipt.items[1].kind, MediaKind::Video);
        for item in &receipt.items {
            assert!(Path::new(&item.file_ref).exists());
        }
        // The source files are left for the job cleanup.
        assert!(src.path().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn reuse_returns_the_earlier_receipt() {
        let out = tempfile::tempdir().unwrap();
        let delivery = LocalDirDelivery::new(out.path());
        let earlier = DeliveryReceipt {
            items: vec![ReceiptItem { kind: MediaKind::Video, file_ref: "x.mp4".into() }],
        };
        let receipt = delivery
            .deliver(&target(), DeliveryPayload::Reuse(&earlier))
            .await
            .unwrap();
        assert_eq!(receipt, earlier);
    }
}
