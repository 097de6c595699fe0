//! Scanning and ordering of files written by extractors.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::artifact::{MediaItem, MediaKind};

/// Files at or below this size are treated as failed writes.
pub const MIN_MEDIA_BYTES: u64 = 100;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "ogg", "aac", "opus", "wav"];

/// Index used for files whose name carries no number.
const UNINDEXED: u32 = 99_999;

static TRAILING_SEPARATED_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_\s-](\d+)$").unwrap());
static TRAILING_INDEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)$").unwrap());
static ANY_INDEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());

pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

/// Numeric position encoded in a file stem such as `post_3.jpg` or `img12`.
pub fn filename_index(path: &Path) -> u32 {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return UNINDEXED;
    };
    [&*TRAILING_SEPARATED_INDEX, &*TRAILING_INDEX, &*ANY_INDEX]
        .iter()
        .find_map(|re| re.captures(stem))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(UNINDEXED)
}

/// Order by filename index, then by name so equal indices stay stable.
pub fn compare_by_index(a: &Path, b: &Path) -> Ordering {
    filename_index(a)
        .cmp(&filename_index(b))
        .then_with(|| a.file_name().cmp(&b.file_name()))
}

/// Recursively collect recognised media files larger than [`MIN_MEDIA_BYTES`].
pub async fn scan_media(dir: &Path) -> std::io::Result<Vec<MediaItem>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let Some(kind) = media_kind(&path) else {
                continue;
            };
            if meta.len() <= MIN_MEDIA_BYTES {
                debug!(path = %path.display(), size = meta.len(), "skipping undersized file");
                continue;
            }
            found.push(MediaItem {
                path,
                kind,
                size_bytes: meta.len(),
            });
        }
    }

    found.sort_by(|a, b| compare_by_index(&a.path, &b.path));
    Ok(found)
}

pub fn total_size<'a>(items: impl IntoIterator<Item = &'a MediaItem>) -> u64 {
    items.into_iter().map(|i| i.size_bytes).sum()
}

pub fn paths_of(items: &[MediaItem]) -> Vec<PathBuf> {
    items.iter().map(|i| i.path.clone()).collect()
}
