use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::{FramePlan, plan_frames};
use super::{OptimizedVideo, SlideshowInput, SynthesisError, SynthesizedVideo, Synthesizer};

/// Below this size the output is treated as corrupt.
const MIN_OUTPUT_BYTES: u64 = 100;
const SCRIPT_NAME: &str = "slides.ffconcat";
const OUTPUT_NAME: &str = "slideshow.mp4";
const OPTIMIZED_NAME: &str = "optimized.mp4";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Renders slideshows with ffmpeg's concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegSynthesizer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    default_frame: Duration,
    timeout: Duration,
    optimize_videos: bool,
}

impl FfmpegSynthesizer {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
        default_frame: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            default_frame,
            timeout,
            optimize_videos: false,
        }
    }

    /// Re-encode downloaded videos to H.264 baseline/AAC with `+faststart`.
    pub fn with_video_optimization(mut self, enabled: bool) -> Self {
        self.optimize_videos = enabled;
        self
    }

    /// Length of an audio file according to ffprobe.
    pub async fn probe_duration(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, SynthesisError> {
        let mut cmd = process_utils::tokio_command(&self.ffprobe);
        cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path);
        let output = process_utils::run_with_deadline(cmd, PROBE_TIMEOUT, cancel).await?;
        if !output.status.success() {
            return Err(SynthesisError::Probe(tail(&output.stderr_lossy())));
        }
        parse_probe_duration(&output.stdout)
    }

    fn build_args(&self, script: &Path, audio: Option<&Path>, plan: &FramePlan, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(script.display().to_string());
        if let Some(audio) = audio {
            args.push("-i".into());
            args.push(audio.display().to_string());
        }
        args.extend(["-map", "0:v:0"].map(String::from));
        if audio.is_some() {
            args.extend(["-map", "1:a:0"].map(String::from));
        }
        args.extend(
            [
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2,setsar=1,fps=30",
                "-c:v",
                "libx264",
                "-tune",
                "stillimage",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
            ]
            .map(String::from),
        );
        if audio.is_some() {
            args.extend(["-c:a", "aac", "-b:a", "192k", "-shortest"].map(String::from));
        }
        args.push("-t".into());
        args.push(format!("{:.3}", plan.total.as_secs_f64()));
        args.extend(["-movflags", "+faststart"].map(String::from));
        args.push(output.display().to_string());
        args
    }
}

fn optimize_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "warning", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(input.display().to_string());
    args.extend(
        [
            "-max_muxing_queue_size",
            "9999",
            "-c:v",
            "libx264",
            "-crf",
            "28",
            "-maxrate",
            "4.5M",
            "-bufsize",
            "9M",
            "-preset",
            "faster",
            "-flags",
            "+global_header",
            "-pix_fmt",
            "yuv420p",
            "-profile:v",
            "baseline",
            "-movflags",
            "+faststart",
            "-c:a",
            "aac",
            "-ac",
            "2",
        ]
        .map(String::from),
    );
    args.push(output.display().to_string());
    args
}

/// ffconcat script for a plan. The last file is listed twice so its
/// duration is honoured by the demuxer.
pub(crate) fn concat_script(plan: &FramePlan) -> String {
    let mut script = String::from("ffconcat version 1.0\n");
    for frame in &plan.frames {
        let _ = writeln!(script, "file '{}'", escape_path(&frame.image));
        let _ = writeln!(script, "duration {:.3}", frame.duration.as_secs_f64());
    }
    if let Some(last) = plan.frames.last() {
        let _ = writeln!(script, "file '{}'", escape_path(&last.image));
    }
    script
}

fn escape_path(path: &Path) -> String {
    path.display().to_string().replace('\'', r"'\''")
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeSection>,
    #[serde(default)]
    streams: Vec<ProbeSection>,
}

#[derive(Deserialize)]
struct ProbeSection {
    #[serde(default)]
    duration: Option<String>,
}

fn parse_probe_duration(stdout: &[u8]) -> Result<Duration, SynthesisError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| SynthesisError::Probe(format!("invalid ffprobe output: {e}")))?;
    parsed
        .format
        .iter()
        .chain(parsed.streams.iter())
        .filter_map(|s| s.duration.as_deref())
        .filter_map(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .find_map(|d| Duration::try_from_secs_f64(d).ok())
        .ok_or_else(|| SynthesisError::Probe("no duration reported".into()))
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(3)..].join(" | ")
}

#[async_trait]
impl Synthesizer for FfmpegSynthesizer {
    async fn synthesize(
        &self,
        input: &SlideshowInput,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedVideo, SynthesisError> {
        if input.images.is_empty() {
            return Err(SynthesisError::NoImages);
        }

        let audio_len = match &input.audio {
            Some(audio) => match self.probe_duration(audio, cancel).await {
                Ok(d) => Some(d),
                Err(SynthesisError::Probe(reason)) => {
                    warn!(audio = %audio.display(), %reason, "ignoring unreadable audio track");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let audio = audio_len.and(input.audio.as_deref());

        let images: Vec<PathBuf> = input
            .images
            .iter()
            .map(std::path::absolute)
            .collect::<Result<_, _>>()?;
        let plan = plan_frames(
            &images,
            input.frame_durations.as_deref(),
            self.default_frame,
            audio_len,
        )?;

        tokio::fs::create_dir_all(&input.output_dir).await?;
        let script = input.output_dir.join(SCRIPT_NAME);
        tokio::fs::write(&script, concat_script(&plan)).await?;
        let output = input.output_dir.join(OUTPUT_NAME);

        let mut cmd = process_utils::tokio_command(&self.ffmpeg);
        cmd.args(self.build_args(&script, audio, &plan, &output));

        info!(
            images = input.images.len(),
            frames = plan.frames.len(),
            total = ?plan.total,
            with_audio = audio.is_some(),
            "rendering slideshow"
        );
        let result = process_utils::run_with_deadline(cmd, self.timeout, cancel).await?;
        debug!(elapsed = ?result.elapsed, status = ?result.status, "ffmpeg finished");

        if !result.status.success() {
            return Err(SynthesisError::Failed {
                status: result.status.to_string(),
                stderr: tail(&result.stderr_lossy()),
            });
        }

        let size_bytes = match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.len() > MIN_OUTPUT_BYTES => meta.len(),
            _ => return Err(SynthesisError::EmptyOutput(output)),
        };

        Ok(SynthesizedVideo {
            path: output,
            size_bytes,
            duration: plan.total,
        })
    }

    async fn optimize(
        &self,
        video: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<OptimizedVideo>, SynthesisError> {
        if !self.optimize_videos {
            return Ok(None);
        }
        tokio::fs::create_dir_all(output_dir).await?;
        let output = output_dir.join(OPTIMIZED_NAME);

        let mut cmd = process_utils::tokio_command(&self.ffmpeg);
        cmd.args(optimize_args(&std::path::absolute(video)?, &output));
        info!(input = %video.display(), "re-encoding video");
        let result = process_utils::run_with_deadline(cmd, self.timeout, cancel).await?;
        debug!(elapsed = ?result.elapsed, status = ?result.status, "ffmpeg finished");

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(SynthesisError::Failed {
                status: result.status.to_string(),
                stderr: tail(&result.stderr_lossy()),
            });
        }
        match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.len() > MIN_OUTPUT_BYTES => Ok(Some(OptimizedVideo {
                path: output,
                size_bytes: meta.len(),
            })),
            _ => {
                let _ = tokio::fs::remove_file(&output).await;
                Err(SynthesisError::EmptyOutput(output))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(n: usize) -> FramePlan {
        plan_frames(
            &(1..=n).map(|i| PathBuf::from(format!("/w/{i}.jpg"))).collect::<Vec<_>>(),
            None,
            Duration::from_secs(2),
            None,
        )
        .unwrap()
    }

    #[test]
    fn script_lists_frames_and_repeats_last() {
        let script = concat_script(&plan(3));
        let expected = "ffconcat version 1.0\n\
            file '/w/1.jpg'\nduration 2.000\n\
            file '/w/2.jpg'\nduration 2.000\n\
            file '/w/3.jpg'\nduration 2.000\n\
            file '/w/3.jpg'\n";
        assert_eq!(script, expected);
    }

    #[test]
    fn quotes_in_paths_are_escaped() {
        assert_eq!(escape_path(Path::new("/w/it's.jpg")), r"/w/it'\''s.jpg");
    }

    #[test]
    fn args_bound_length_and_map_audio() {
        let synth = FfmpegSynthesizer::new("ffmpeg", "ffprobe", Duration::from_secs(2), Duration::from_secs(60));
        let p = plan(3);
        let args = synth.build_args(Path::new("/w/s.ffconcat"), Some(Path::new("/w/a.m4a")), &p, Path::new("/w/o.mp4"));
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "6.000");
        assert!(args.iter().any(|a| a == "1:a:0"));
        assert!(args.iter().any(|a| a == "-shortest"));
        assert_eq!(args.last().unwrap(), "/w/o.mp4");

        let silent = synth.build_args(Path::new("/w/s.ffconcat"), None, &p, Path::new("/w/o.mp4"));
        assert!(!silent.iter().any(|a| a == "-shortest"));
    }

    #[test]
    fn optimize_targets_baseline_with_faststart() {
        let args = optimize_args(Path::new("/w/in.webm"), Path::new("/w/opt/out.mp4"));
        let value = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].as_str()
        };
        assert_eq!(value("-i"), "/w/in.webm");
        assert_eq!(value("-c:v"), "libx264");
        assert_eq!(value("-profile:v"), "baseline");
        assert_eq!(value("-c:a"), "aac");
        assert_eq!(value("-movflags"), "+faststart");
        assert_eq!(args.last().unwrap(), "/w/opt/out.mp4");
    }

    #[test]
    fn probe_prefers_format_then_stream_duration() {
        let both = br#"{"format":{"duration":"6.020000"},"streams":[{"duration":"5.9"}]}"#;
        assert_eq!(parse_probe_duration(both).unwrap(), Duration::from_secs_f64(6.02));
        let stream_only = br#"{"format":{},"streams":[{"codec_type":"audio","duration":"4.5"}]}"#;
        assert_eq!(parse_probe_duration(stream_only).unwrap(), Duration::from_secs_f64(4.5));
        assert!(parse_probe_duration(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe_duration(b"not json").is_err());
        let absurd = br#"{"format":{"duration":"1e300"},"streams":[{"duration":"3.0"}]}"#;
        assert_eq!(parse_probe_duration(absurd).unwrap(), Duration::from_secs(3));
        assert!(parse_probe_duration(br#"{"format":{"duration":"inf"}}"#).is_err());
    }

    #[cfg(unix)]
    mod with_fake_ffmpeg {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn input(dir: &Path) -> SlideshowInput {
            let images: Vec<PathBuf> = (1..=3)
                .map(|i| {
                    let p = dir.join(format!("{i}.jpg"));
                    std::fs::write(&p, vec![0u8; 256]).unwrap();
                    p
                })
                .collect();
            SlideshowInput {
                images,
                audio: None,
                frame_durations: None,
                output_dir: dir.join("out"),
            }
        }

        #[tokio::test]
        async fn non_zero_exit_is_synthesis_error() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(dir.path(), "ffmpeg", "echo 'Invalid data found' >&2; exit 1");
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10));
            let input = input(dir.path());

            let err = synth.synthesize(&input, &CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, SynthesisError::Failed { .. }));
            assert_eq!(err.kind(), media_providers::FailureKind::SynthesisError);
            assert!(input.images.iter().all(|p| p.exists()), "inputs must survive");
        }

        #[tokio::test]
        async fn empty_output_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            // Touch the last argument (the output path) and exit 0.
            let ffmpeg = script(dir.path(), "ffmpeg", r#"for last; do :; done; : > "$last""#);
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10));

            let err = synth.synthesize(&input(dir.path()), &CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, SynthesisError::EmptyOutput(_)));
        }

        #[tokio::test]
        async fn success_reports_planned_duration() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                dir.path(),
                "ffmpeg",
                r#"for last; do :; done; head -c 4096 /dev/zero > "$last""#,
            );
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10));
            let input = input(dir.path());

            let video = synth.synthesize(&input, &CancellationToken::new()).await.unwrap();
            assert_eq!(video.duration, Duration::from_secs(6));
            assert_eq!(video.size_bytes, 4096);
            let script = std::fs::read_to_string(input.output_dir.join(SCRIPT_NAME)).unwrap();
            assert_eq!(script.matches("duration 2.000").count(), 3);
        }

        #[tokio::test]
        async fn optimize_is_off_by_default() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(dir.path(), "ffmpeg", "exit 1");
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10));

            let optimized = synth
                .optimize(&dir.path().join("clip.mp4"), &dir.path().join("opt"), &CancellationToken::new())
                .await
                .unwrap();
            assert!(optimized.is_none());
        }

        #[tokio::test]
        async fn optimize_writes_into_output_dir() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                dir.path(),
                "ffmpeg",
                r#"for last; do :; done; head -c 2048 /dev/zero > "$last""#,
            );
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10))
                .with_video_optimization(true);
            let clip = dir.path().join("clip.mp4");
            std::fs::write(&clip, vec![0u8; 512]).unwrap();

            let optimized = synth
                .optimize(&clip, &dir.path().join("opt"), &CancellationToken::new())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(optimized.path, dir.path().join("opt").join(OPTIMIZED_NAME));
            assert_eq!(optimized.size_bytes, 2048);
            assert!(clip.exists());
        }

        #[tokio::test]
        async fn failed_optimize_leaves_no_output() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                dir.path(),
                "ffmpeg",
                r#"for last; do :; done; echo partial > "$last"; echo 'Unknown encoder' >&2; exit 1"#,
            );
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_secs(10))
                .with_video_optimization(true);
            let clip = dir.path().join("clip.mp4");
            std::fs::write(&clip, vec![0u8; 512]).unwrap();

            let err = synth
                .optimize(&clip, &dir.path().join("opt"), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, SynthesisError::Failed { .. }));
            assert!(!dir.path().join("opt").join(OPTIMIZED_NAME).exists());
        }

        #[tokio::test]
        async fn hung_ffmpeg_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(dir.path(), "ffmpeg", "sleep 30");
            let synth = FfmpegSynthesizer::new(ffmpeg, "ffprobe", Duration::from_secs(2), Duration::from_millis(200));

            let err = synth.synthesize(&input(dir.path()), &CancellationToken::new()).await.unwrap_err();
            assert_eq!(err.kind(), media_providers::FailureKind::Timeout);
        }
    }
}
