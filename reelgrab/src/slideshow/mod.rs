//! Image-sequence to video synthesis and video re-encoding.

mod ffmpeg;
mod plan;

pub use ffmpeg::FfmpegSynthesizer;
pub use plan::{FramePlan, PlannedFrame, plan_frames};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use media_providers::FailureKind;
use process_utils::ProcessError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("slideshow has no images")]
    NoImages,

    #[error("could not read audio duration: {0}")]
    Probe(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("ffmpeg produced an empty or missing file: {}", .0.display())]
    EmptyOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SynthesisError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SynthesisError::Process(ProcessError::Timeout { .. }) => FailureKind::Timeout,
            SynthesisError::Process(ProcessError::Cancelled { .. }) => FailureKind::Cancelled,
            _ => FailureKind::SynthesisError,
        }
    }
}

/// Inputs for one slideshow. Image and audio files are only read.
#[derive(Debug, Clone)]
pub struct SlideshowInput {
    pub images: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
    pub frame_durations: Option<Vec<Duration>>,
    /// Directory that receives the rendered video and the concat script.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedVideo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration: Duration,
}

/// A downloaded video re-encoded for chat playback.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedVideo {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        input: &SlideshowInput,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedVideo, SynthesisError>;

    /// Re-encode `video` into `output_dir`. `Ok(None)` keeps the original.
    async fn optimize(
        &self,
        _video: &Path,
        _output_dir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Option<OptimizedVideo>, SynthesisError> {
        Ok(None)
    }
}
