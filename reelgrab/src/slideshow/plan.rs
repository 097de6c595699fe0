use std::path::{Path, PathBuf};
use std::time::Duration;

use super::SynthesisError;

const FALLBACK_FRAME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFrame {
    pub image: PathBuf,
    pub duration: Duration,
}

/// Display timeline for a slideshow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    pub frames: Vec<PlannedFrame>,
    pub total: Duration,
}

/// Lay out frames for a slideshow.
///
/// Each image shows for its supplied duration, or `default_frame` when none
/// (or zero) is given. Without audio the total is the sum of the frame
/// durations. With audio the total equals the audio length: a shorter
/// sequence is looped in order and the last frame cut to fit, a longer one
/// is compressed proportionally so every image still appears.
pub fn plan_frames(
    images: &[PathBuf],
    frame_durations: Option<&[Duration]>,
    default_frame: Duration,
    audio: Option<Duration>,
) -> Result<FramePlan, SynthesisError> {
    if images.is_empty() {
        return Err(SynthesisError::NoImages);
    }

    let default_frame = if default_frame.is_zero() {
        FALLBACK_FRAME
    } else {
        default_frame
    };
    let base: Vec<Duration> = (0..images.len())
        .map(|i| {
            frame_durations
                .and_then(|d| d.get(i).copied())
                .filter(|d| !d.is_zero())
                .unwrap_or(default_frame)
        })
        .collect();
    let sum: Duration = base.iter().sum();

    let target = match audio.filter(|a| !a.is_zero()) {
        Some(a) => a,
        None => return Ok(build(images, &base)),
    };

    if sum == target {
        Ok(build(images, &base))
    } else if sum < target {
        Ok(looped(images, &base, target))
    } else {
        Ok(compressed(images, &base, sum, target))
    }
}

fn build(images: &[PathBuf], durations: &[Duration]) -> FramePlan {
    let frames: Vec<PlannedFrame> = images
        .iter()
        .zip(durations)
        .map(|(image, duration)| frame(image, *duration))
        .collect();
    let total = frames.iter().map(|f| f.duration).sum();
    FramePlan { frames, total }
}

fn looped(images: &[PathBuf], base: &[Duration], target: Duration) -> FramePlan {
    let mut frames = Vec::new();
    let mut elapsed = Duration::ZERO;
    for (image, duration) in images.iter().zip(base).cycle() {
        let left = target - elapsed;
        if left.is_zero() {
            break;
        }
        let shown = (*duration).min(left);
        frames.push(frame(image, shown));
        elapsed += shown;
    }
    FramePlan {
        frames,
        total: target,
    }
}

fn compressed(images: &[PathBuf], base: &[Duration], sum: Duration, target: Duration) -> FramePlan {
    let scale = target.as_nanos() as f64 / sum.as_nanos() as f64;
    let mut frames: Vec<PlannedFrame> = images
        .iter()
        .zip(base)
        .map(|(image, d)| frame(image, Duration::from_nanos((d.as_nanos() as f64 * scale) as u64)))
        .collect();

    // Rounding residue goes to the last frame so the total is exact.
    let head: Duration = frames[..frames.len() - 1].iter().map(|f| f.duration).sum();
    if let Some(last) = frames.last_mut() {
        last.duration = target.saturating_sub(head);
    }
    FramePlan {
        frames,
        total: target,
    }
}

fn frame(image: &Path, duration: Duration) -> PlannedFrame {
    PlannedFrame {
        image: image.to_path_buf(),
        duration,
    }
}
