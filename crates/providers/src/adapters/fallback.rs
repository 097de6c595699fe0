use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::adapter::{FetchRequest, ProviderAdapter};
use crate::artifact::MediaArtifact;
use crate::error::FetchError;

/// Tries `primary`, then `secondary` when the primary reports the target
/// holds no video.
///
/// Used for platforms whose posts may be photo slideshows that a video
/// extractor cannot handle.
pub struct FallbackAdapter {
    primary: Arc<dyn ProviderAdapter>,
    secondary: Arc<dyn ProviderAdapter>,
}

impl FallbackAdapter {
    pub fn new(primary: Arc<dyn ProviderAdapter>, secondary: Arc<dyn ProviderAdapter>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl ProviderAdapter for FallbackAdapter {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<MediaArtifact, FetchError> {
        match self.primary.fetch(request).await {
            Err(err @ (FetchError::NonVideo(_) | FetchError::InvalidUrl(_))) => {
                info!(
                    url = %request.url,
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    reason = %err,
                    "falling back to gallery extraction"
                );
                self.secondary.fetch(request).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderTag;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Scripted {
        calls: AtomicU32,
        result: fn() -> Result<MediaArtifact, FetchError>,
    }

    impl Scripted {
        fn new(result: fn() -> Result<MediaArtifact, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                result,
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<MediaArtifact, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new(
            ProviderTag::TikTok,
            "https://tiktok.com/@a/photo/1",
            "/tmp/job",
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn video() -> Result<MediaArtifact, FetchError> {
        Ok(MediaArtifact::Video {
            path: "v.mp4".into(),
            size_bytes: 1_000,
        })
    }

    #[tokio::test]
    async fn non_video_falls_back() {
        let primary = Scripted::new(|| Err(FetchError::NonVideo("photo post".into())));
        let secondary = Scripted::new(video);
        let adapter = FallbackAdapter::new(primary.clone(), secondary.clone());

        assert!(adapter.fetch(&request()).await.is_ok());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_required_does_not_fall_back() {
        let primary = Scripted::new(|| Err(FetchError::AuthRequired("login".into())));
        let secondary = Scripted::new(video);
        let adapter = FallbackAdapter::new(primary, secondary.clone());

        let err = adapter.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, FetchError::AuthRequired(_)));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }
}
