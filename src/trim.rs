use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::loops::LoopCandidate;
use crate::{Error, Result};

/// How to reconcile the source aspect ratio with a requested output resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum, serde::Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResizeStrategy {
    /// Scale to fill the target and crop the overflow.
    Crop,
    /// Scale to fit the target and pad the remainder with black.
    Pad,
    /// Scale to fit and center, padding with black bars.
    Center,
}

impl Display for ResizeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResizeStrategy::Crop => "crop",
            ResizeStrategy::Pad => "pad",
            ResizeStrategy::Center => "center",
        };
        write!(f, "{}", name)
    }
}

/// Output shaping options for [VideoTrimmer::trim].
#[derive(Clone, Debug, serde::Serialize)]
pub struct TrimOptions {
    /// Extra seconds included before the loop start.
    pub buffer_start: f64,
    /// Extra seconds included after the loop end.
    pub buffer_end: f64,
    /// Target resolution; `None` keeps the source resolution.
    pub resolution: Option<(u32, u32)>,
    /// Playback speed multiplier (1.0 = normal).
    pub speed: f64,
    /// Whether to carry the audio track into the output.
    pub include_audio: bool,
    /// Strategy used when `resolution` changes the aspect ratio.
    pub resize_strategy: ResizeStrategy,
}

impl Default for TrimOptions {
    fn default() -> Self {
        Self {
            buffer_start: 0.0,
            buffer_end: 0.0,
            resolution: None,
            speed: 1.0,
            include_audio: true,
            resize_strategy: ResizeStrategy::Center,
        }
    }
}

/// Cuts a detected loop out of the source video by spawning the `ffmpeg` binary.
///
/// The encoder settings are fixed: H.264 at `-preset medium -crf 18`, AAC at 128k when
/// audio is kept. Everything else is derived from the [LoopCandidate] and
/// [TrimOptions].
#[derive(Clone, Debug)]
pub struct VideoTrimmer {
    ffmpeg_path: PathBuf,
}

impl Default for VideoTrimmer {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoTrimmer {
    /// Constructs a trimmer that resolves `ffmpeg` through `PATH`.
    pub fn new() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }

    /// Returns a new [VideoTrimmer] using the provided ffmpeg executable.
    pub fn with_ffmpeg_path(mut self, ffmpeg_path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = ffmpeg_path.into();
        self
    }

    /// Cuts `[candidate.start_time, candidate.end_time]` (plus buffers) from `input`
    /// into `output`.
    pub fn trim(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        candidate: &LoopCandidate,
        options: &TrimOptions,
    ) -> Result<()> {
        let input = input.as_ref();
        let output = output.as_ref();
        if !input.exists() {
            return Err(Error::PathNotFound(input.to_owned()));
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let args = build_args(input, output, candidate, options);
        tracing::debug!("running ffmpeg {}", args.join(" "));

        let result = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            // ffmpeg is chatty; keep only the tail, which carries the actual error.
            let tail: Vec<&str> = stderr.lines().rev().take(8).collect();
            return Err(Error::TrimFailed {
                status: result.status,
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }

        tracing::debug!("wrote {}", output.display());
        Ok(())
    }

    /// Cheap sanity check that the output file exists and looks like a video.
    pub fn validate_output(&self, output: impl AsRef<Path>) -> bool {
        crate::util::is_valid_video_file(output, false)
    }
}

fn build_args(
    input: &Path,
    output: &Path,
    candidate: &LoopCandidate,
    options: &TrimOptions,
) -> Vec<String> {
    let start = (candidate.start_time - options.buffer_start).max(0.0);
    let duration = candidate.end_time + options.buffer_end - start;

    let mut args = vec![
        "-y".to_string(),
        "-ss".to_string(),
        format!("{:.6}", start),
        "-t".to_string(),
        format!("{:.6}", duration),
        "-i".to_string(),
        input.display().to_string(),
    ];

    let mut video_filters = Vec::new();
    if options.speed != 1.0 {
        video_filters.push(format!("setpts={}*PTS", 1.0 / options.speed));
    }
    if let Some((width, height)) = options.resolution {
        match options.resize_strategy {
            ResizeStrategy::Crop => {
                video_filters.push(format!(
                    "scale={w}:{h}:force_original_aspect_ratio=increase",
                    w = width,
                    h = height
                ));
                video_filters.push(format!("crop={}:{}", width, height));
            }
            ResizeStrategy::Pad | ResizeStrategy::Center => {
                video_filters.push(format!(
                    "scale={w}:{h}:force_original_aspect_ratio=decrease",
                    w = width,
                    h = height
                ));
                video_filters.push(format!(
                    "pad={}:{}:(ow-iw)/2:(oh-ih)/2:color=black",
                    width, height
                ));
            }
        }
    }
    if !video_filters.is_empty() {
        args.push("-vf".to_string());
        args.push(video_filters.join(","));
    }

    if options.include_audio && options.speed != 1.0 {
        args.push("-af".to_string());
        args.push(format!("atempo={}", options.speed));
    }

    args.extend(
        ["-c:v", "libx264", "-preset", "medium", "-crf", "18"]
            .iter()
            .map(|s| s.to_string()),
    );

    if options.include_audio {
        args.extend(
            ["-c:a", "aac", "-b:a", "128k"].iter().map(|s| s.to_string()),
        );
    } else {
        args.push("-an".to_string());
    }

    args.push(output.display().to_string());
    args
}
