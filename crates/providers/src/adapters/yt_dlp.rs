use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapter::{Credentials, FetchRequest, ProviderAdapter};
use crate::artifact::{MediaArtifact, MediaItem, MediaKind};
use crate::error::{FetchError, classify_stderr};
use crate::media_files::scan_media;

/// Prefer H.264/AAC in mp4 so the result plays inline in chat clients.
const FORMAT_SELECTOR: &str = "bv*[ext=mp4][vcodec^=avc][height<=1440]+ba[ext=m4a]/\
b[ext=mp4][vcodec^=avc][height<=1440]/bv*[height<=1440]+ba/b[height<=1440]/bv*+ba/b";

const OUTPUT_SUBDIR: &str = "yt-dlp";

/// Single-video extraction through `yt-dlp`.
#[derive(Debug, Clone)]
pub struct YtDlpAdapter {
    binary: PathBuf,
    credentials: Arc<Credentials>,
    max_filesize_mb: u64,
}

impl YtDlpAdapter {
    pub fn new(binary: impl Into<PathBuf>, credentials: Arc<Credentials>, max_filesize_mb: u64) -> Self {
        Self {
            binary: binary.into(),
            credentials,
            max_filesize_mb,
        }
    }

    fn build_args(&self, request: &FetchRequest, out_dir: &std::path::Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--no-mtime".into(),
            "--restrict-filenames".into(),
            "-f".into(),
            FORMAT_SELECTOR.into(),
            "--merge-output-format".into(),
            "mp4".into(),
            "--max-filesize".into(),
            format!("{}M", self.max_filesize_mb).into(),
            "-o".into(),
            out_dir.join("%(id)s.%(ext)s").into_os_string(),
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

/// Prefer the merged mp4, otherwise the largest video.
fn pick_video(items: Vec<MediaItem>) -> Option<MediaItem> {
    let mut videos: Vec<MediaItem> = items
        .into_iter()
        .filter(|i| i.kind == MediaKind::Video)
        .collect();
    videos.sort_by_key(|v| {
        let is_mp4 = v
            .path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4"));
        (is_mp4, v.size_bytes)
    });
    videos.pop()
}

#[async_trait]
impl ProviderAdapter for YtDlpAdapter {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<MediaArtifact, FetchError> {
        let out_dir = request.work_dir.join(OUTPUT_SUBDIR);
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut cmd = process_utils::tokio_command(&self.binary);
        cmd.args(self.build_args(request, &out_dir));

        info!(provider = %request.provider, url = %request.url, "running yt-dlp");
        let output = process_utils::run_with_deadline(cmd, request.remaining()?, &request.cancel).await?;
        debug!(elapsed = ?output.elapsed, status = ?output.status, "yt-dlp finished");

        if !output.status.success() {
            return Err(classify_stderr("yt-dlp", &output.stderr_lossy()));
        }

        let items = scan_media(&out_dir).await?;
        match pick_video(items) {
            Some(video) => Ok(MediaArtifact::Video {
                path: video.path,
                size_bytes: video.size_bytes,
            }),
            None => Err(FetchError::NonVideo(format!(
                "yt-dlp produced no video for {}",
                request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderTag;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn item(name: &str, kind: MediaKind, size: u64) -> MediaItem {
        MediaItem {
            path: PathBuf::from(name),
            kind,
            size_bytes: size,
        }
    }

    #[test]
    fn prefers_mp4_over_larger_webm() {
        let picked = pick_video(vec![
            item("a.webm", MediaKind::Video, 9_000),
            item("a.mp4", MediaKind::Video, 5_000),
            item("a.jpg", MediaKind::Image, 20_000),
        ])
        .unwrap();
        assert_eq!(picked.path, PathBuf::from("a.mp4"));
    }

    #[test]
    fn images_only_yield_no_video() {
        assert!(pick_video(vec![item("a.jpg", MediaKind::Image, 500)]).is_none());
    }

    #[test]
    fn cookie_file_is_passed_for_matching_provider() {
        let cookie = tempfile::NamedTempFile::new().unwrap();
        let creds = Credentials::new()
            .with_cookie_file(ProviderTag::Instagram, cookie.path())
            .into_shared();
        let adapter = YtDlpAdapter::new("yt-dlp", creds, 250);

        let insta = FetchRequest::new(
            ProviderTag::Instagram,
            "https://instagram.com/p/x",
            "/tmp/job",
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let args = adapter.build_args(&insta, std::path::Path::new("/tmp/job/yt-dlp"));
        assert!(args.iter().any(|a| a == "--cookies"));
        assert_eq!(args.last().unwrap(), "https://instagram.com/p/x");

        let yt = FetchRequest {
            provider: ProviderTag::YouTube,
            ..insta
        };
        let args = adapter.build_args(&yt, std::path::Path::new("/tmp/job/yt-dlp"));
        assert!(!args.iter().any(|a| a == "--cookies"));
    }
}
