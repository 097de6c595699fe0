use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{Credentials, ProviderAdapter};
use crate::adapters::{ExtractorTools, FallbackAdapter, GalleryDlAdapter, YtDlpAdapter};
use crate::provider::ProviderTag;

/// Dispatch table from provider tag to adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderTag, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production table: yt-dlp everywhere, with a gallery-dl fallback
    /// for platforms that serve photo posts.
    pub fn with_extractors(tools: &ExtractorTools, credentials: Arc<Credentials>) -> Self {
        let yt_dlp: Arc<dyn ProviderAdapter> = Arc::new(YtDlpAdapter::new(
            &tools.yt_dlp,
            credentials.clone(),
            tools.max_filesize_mb,
        ));
        let gallery: Arc<dyn ProviderAdapter> =
            Arc::new(GalleryDlAdapter::new(&tools.gallery_dl, credentials));
        let with_gallery: Arc<dyn ProviderAdapter> =
            Arc::new(FallbackAdapter::new(yt_dlp.clone(), gallery));

        let mut registry = Self::new();
        registry
            .register(ProviderTag::YouTube, yt_dlp.clone())
            .register(ProviderTag::Reddit, yt_dlp)
            .register(ProviderTag::TikTok, with_gallery.clone())
            .register(ProviderTag::Instagram, with_gallery);
        registry
    }

    pub fn register(&mut self, tag: ProviderTag, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
        self.adapters.insert(tag, adapter);
        self
    }

    pub fn get(&self, tag: ProviderTag) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&tag).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderTag> + '_ {
        self.adapters.keys().copied()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.adapters.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_table_covers_every_provider() {
        let registry =
            AdapterRegistry::with_extractors(&ExtractorTools::default(), Credentials::new().into_shared());
        for tag in ProviderTag::ALL {
            assert!(registry.get(tag).is_some(), "{tag} has no adapter");
        }
        assert_eq!(registry.providers().count(), ProviderTag::ALL.len());
    }
}
