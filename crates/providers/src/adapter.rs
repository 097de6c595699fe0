use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::artifact::MediaArtifact;
use crate::error::FetchError;
use crate::provider::ProviderTag;

/// Everything an adapter needs for one fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub provider: ProviderTag,
    pub url: String,
    /// Job-scoped directory; adapters write only below it.
    pub work_dir: PathBuf,
    /// Hard wall-clock bound for the whole invocation.
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl FetchRequest {
    pub fn new(
        provider: ProviderTag,
        url: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            url: url.into(),
            work_dir: work_dir.into(),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Time left before the deadline, or a timeout error once it has passed.
    pub fn remaining(&self) -> Result<Duration, FetchError> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(FetchError::Timeout(Duration::ZERO))
        } else {
            Ok(left)
        }
    }
}

/// Retrieves media for one provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    async fn fetch(&self, request: &FetchRequest) -> Result<MediaArtifact, FetchError>;
}

/// Session cookie files per provider, in Netscape format.
///
/// Read-only once built; adapters share it through an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    cookies: HashMap<ProviderTag, PathBuf>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cookie file. Missing files are ignored with a warning, so
    /// restricted content reports `AuthRequired` instead of a tool error.
    pub fn with_cookie_file(mut self, provider: ProviderTag, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_file() {
            self.cookies.insert(provider, path);
        } else {
            warn!(%provider, path = %path.display(), "cookie file not found, ignoring");
        }
        self
    }

    pub fn cookie_file(&self, provider: ProviderTag) -> Option<&Path> {
        self.cookies.get(&provider).map(PathBuf::as_path)
    }

    pub fn has(&self, provider: ProviderTag) -> bool {
        self.cookies.contains_key(&provider)
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
