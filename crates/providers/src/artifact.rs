use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broad media category of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
    Audio,
}

/// One file inside a [`MediaArtifact::Collection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Video,
    ImageSequence,
    Collection,
}

/// Media produced by an adapter or by slideshow synthesis.
///
/// All paths live inside the job's working directory.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaArtifact {
    /// A single ready-to-send video file.
    Video { path: PathBuf, size_bytes: u64 },
    /// Ordered still images with an optional soundtrack; needs synthesis
    /// before delivery.
    ImageSequence {
        images: Vec<PathBuf>,
        audio: Option<PathBuf>,
        /// Per-image display durations, when the provider supplies them.
        frame_durations: Option<Vec<Duration>>,
        size_bytes: u64,
    },
    /// Independent media files delivered one by one.
    Collection { items: Vec<MediaItem>, size_bytes: u64 },
}

impl MediaArtifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            MediaArtifact::Video { .. } => ArtifactKind::Video,
            MediaArtifact::ImageSequence { .. } => ArtifactKind::ImageSequence,
            MediaArtifact::Collection { .. } => ArtifactKind::Collection,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            MediaArtifact::Video { size_bytes, .. }
            | MediaArtifact::ImageSequence { size_bytes, .. }
            | MediaArtifact::Collection { size_bytes, .. } => *size_bytes,
        }
    }

    /// Every file the artifact references.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            MediaArtifact::Video { path, .. } => vec![path.as_path()],
            MediaArtifact::ImageSequence { images, audio, .. } => images
                .iter()
                .map(PathBuf::as_path)
                .chain(audio.as_deref())
                .collect(),
            MediaArtifact::Collection { items, .. } => {
                items.iter().map(|i| i.path.as_path()).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_sequence_paths_include_audio_last() {
        let artifact = MediaArtifact::ImageSequence {
            images: vec!["a/1.jpg".into(), "a/2.jpg".into()],
            audio: Some("a/track.m4a".into()),
            frame_durations: None,
            size_bytes: 30,
        };
        let paths: Vec<_> = artifact.paths().into_iter().map(|p| p.to_path_buf()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a/1.jpg"),
                PathBuf::from("a/2.jpg"),
                PathBuf::from("a/track.m4a")
            ]
        );
        assert_eq!(artifact.kind(), ArtifactKind::ImageSequence);
    }
}
