//! Concrete adapters backed by external extractor tools.

mod fallback;
mod gallery_dl;
mod yt_dlp;

pub use fallback::FallbackAdapter;
pub use gallery_dl::GalleryDlAdapter;
pub use yt_dlp::YtDlpAdapter;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Locations and limits for the extractor executables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorTools {
    pub yt_dlp: PathBuf,
    pub gallery_dl: PathBuf,
    /// Passed to yt-dlp as `--max-filesize`.
    pub max_filesize_mb: u64,
}

impl Default for ExtractorTools {
    fn default() -> Self {
        Self {
            yt_dlp: PathBuf::from("yt-dlp"),
            gallery_dl: PathBuf::from("gallery-dl"),
            max_filesize_mb: 250,
        }
    }
}
