use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapter::{Credentials, FetchRequest, ProviderAdapter};
use crate::artifact::{MediaArtifact, MediaItem, MediaKind};
use crate::error::{FetchError, classify_stderr};
use crate::media_files::{paths_of, scan_media, total_size};

const OUTPUT_SUBDIR: &str = "gallery";

/// Photo posts, slideshows and story sets through `gallery-dl`.
#[derive(Debug, Clone)]
pub struct GalleryDlAdapter {
    binary: PathBuf,
    credentials: Arc<Credentials>,
}

impl GalleryDlAdapter {
    pub fn new(binary: impl Into<PathBuf>, credentials: Arc<Credentials>) -> Self {
        Self {
            binary: binary.into(),
            credentials,
        }
    }

    fn build_args(&self, request: &FetchRequest, out_dir: &std::path::Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--directory".into(),
            out_dir.as_os_str().to_owned(),
            "--no-mtime".into(),
            "--no-part".into(),
            "--option".into(),
            "extractor.tiktok.redirect=true".into(),
        ];
        if let Some(cookies) = self.credentials.cookie_file(request.provider) {
            args.push("--cookies".into());
            args.push(cookies.as_os_str().to_owned());
        }
        args.push("--".into());
        args.push(request.url.clone().into());
        args
    }
}

fn is_story_set(url: &str) -> bool {
    url.contains("/stories/")
}

/// Shape scanned files into an artifact.
///
/// Images alone become a slideshow (with the first audio track as its
/// soundtrack). Anything containing video, and story sets, are delivered
/// as a collection.
pub(crate) fn assemble(url: &str, items: Vec<MediaItem>) -> Result<MediaArtifact, FetchError> {
    let (audio, visual): (Vec<MediaItem>, Vec<MediaItem>) =
        items.into_iter().partition(|i| i.kind == MediaKind::Audio);

    if visual.is_empty() {
        return Err(FetchError::NotFound(format!("no media found at {url}")));
    }

    let has_video = visual.iter().any(|i| i.kind == MediaKind::Video);
    if has_video || is_story_set(url) {
        let size_bytes = total_size(&visual);
        return Ok(MediaArtifact::Collection {
            items: visual,
            size_bytes,
        });
    }

    let soundtrack = audio.into_iter().next();
    let size_bytes = total_size(&visual) + soundtrack.as_ref().map_or(0, |a| a.size_bytes);
    Ok(MediaArtifact::ImageSequence {
        images: paths_of(&visual),
        audio: soundtrack.map(|a| a.path),
        frame_durations: None,
        size_bytes,
    })
}

#[async_trait]
impl ProviderAdapter for GalleryDlAdapter {
    fn name(&self) -> &'static str {
        "gallery-dl"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<MediaArtifact, FetchError> {
        let out_dir = request.work_dir.join(OUTPUT_SUBDIR);
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut cmd = process_utils::tokio_command(&self.binary);
        cmd.args(self.build_args(request, &out_dir));

        info!(provider = %request.provider, url = %request.url, "running gallery-dl");
        let output = process_utils::run_with_deadline(cmd, request.remaining()?, &request.cancel).await?;
        debug!(elapsed = ?output.elapsed, status = ?output.status, "gallery-dl finished");

        if !output.status.success() {
            return Err(classify_stderr("gallery-dl", &output.stderr_lossy()));
        }

        let items = scan_media(&out_dir).await?;
        assemble(&request.url, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, kind: MediaKind) -> MediaItem {
        MediaItem {
            path: PathBuf::from(name),
            kind,
            size_bytes: 1_000,
        }
    }

    #[test]
    fn images_with_audio_become_slideshow() {
        let artifact = assemble(
            "https://tiktok.com/@a/photo/1",
            vec![
                item("1.jpg", MediaKind::Image),
                item("2.jpg", MediaKind::Image),
                item("music.mp3", MediaKind::Audio),
                item("extra.m4a", MediaKind::Audio),
            ],
        )
        .unwrap();
        match artifact {
            MediaArtifact::ImageSequence {
                images,
                audio,
                size_bytes,
                ..
            } => {
                assert_eq!(images.len(), 2);
                assert_eq!(audio, Some(PathBuf::from("music.mp3")));
                assert_eq!(size_bytes, 3_000);
            }
            other => panic!("unexpected artifact: {other:?}"),
        }
    }

    #[test]
    fn mixed_media_becomes_collection() {
        let artifact = assemble(
            "https://instagram.com/p/x",
            vec![item("1.jpg", MediaKind::Image), item("2.mp4", MediaKind::Video)],
        )
        .unwrap();
        assert!(matches!(artifact, MediaArtifact::Collection { ref items, .. } if items.len() == 2));
    }

    #[test]
    fn story_images_stay_separate() {
        let artifact = assemble(
            "https://instagram.com/stories/someone",
            vec![item("1.jpg", MediaKind::Image)],
        )
        .unwrap();
        assert!(matches!(artifact, MediaArtifact::Collection { .. }));
    }

    #[test]
    fn audio_only_is_not_found() {
        let err = assemble("https://tiktok.com/x", vec![item("a.mp3", MediaKind::Audio)]).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
        let err = assemble("https://tiktok.com/x", vec![]).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }
}
