#![deny(missing_docs)]

//! # seamloop
//!
//! seamloop finds the best seamless loop inside a video file and cuts it out as a
//! standalone clip. It can be used standalone via a dedicated CLI, or as a library to
//! implement higher-level tools (e.g., wallpaper generators or sprite pipelines).
//!
//! The library exposes two central structs:
//!
//! 1. [LoopDetector](crate::loops::LoopDetector): Samples and fingerprints frames, then
//!    searches the frame-pair space for loop candidates and ranks them.
//! 2. [VideoTrimmer](crate::trim::VideoTrimmer): Cuts a detected loop out of the source
//!    video, optionally re-timing and re-resolving it.
//!
//! ## Basic Usage
//!
//! First, open a video and run a [LoopDetector](crate::loops::LoopDetector) over it.
//!
//! ```no_run
//! use seamloop::loops::{CancellationToken, LoopDetector};
//! use seamloop::video::FfmpegFrameSource;
//!
//! ffmpeg_next::init().unwrap();
//!
//! let mut source = FfmpegFrameSource::open("input.mp4").unwrap();
//! let detector = LoopDetector::default().with_threshold(0.98);
//! let candidates = detector
//!     .detect_loops(&mut source, &CancellationToken::new())
//!     .unwrap();
//!
//! for candidate in &candidates {
//!     println!("{}", candidate);
//! }
//! ```
//!
//! The result is a list of [LoopCandidate](crate::loops::LoopCandidate)s sorted by
//! descending final score; an empty list means no loop met the criteria. Feed the best
//! candidate to a [VideoTrimmer](crate::trim::VideoTrimmer) to produce the output clip:
//!
//! ```no_run
//! use seamloop::trim::{TrimOptions, VideoTrimmer};
//! # fn get_candidate() -> seamloop::loops::LoopCandidate { unimplemented!() }
//!
//! let candidate = get_candidate();
//! let trimmer = VideoTrimmer::new();
//! trimmer.trim("input.mp4", "loop.mp4", &candidate, &TrimOptions::default()).unwrap();
//! ```

use std::path::PathBuf;

/// Detects seamless loops inside a single video.
pub mod loops;
/// Cuts a detected loop out of the source video using FFmpeg.
pub mod trim;
/// Common utility functions.
pub mod util;
/// Frame decoding: the [FrameSource](crate::video::FrameSource) seam and its FFmpeg
/// implementation.
pub mod video;

/// Common error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Analysis window, stride, or threshold out of range.
    #[error("invalid analysis range: {0}")]
    InvalidRange(String),
    /// Unparseable time string.
    #[error("invalid time string: {0:?} (use HH:MM:SS, MM:SS, or seconds)")]
    InvalidTime(String),
    /// The frame source failed irrecoverably.
    #[error("decoder error: {0}")]
    Decoder(String),
    /// The sampler produced zero frames from a non-empty window.
    #[error("no frames decoded from a non-empty window")]
    NoFrames,
    /// The cancellation token was tripped.
    #[error("operation cancelled")]
    Cancelled,
    /// A pipeline postcondition failed. This indicates a bug and is not recoverable.
    #[error("internal consistency check failed: {0}")]
    InternalConsistency(String),
    /// Invalid path.
    #[error("path does not exist: {0:?}")]
    PathNotFound(PathBuf),
    /// The spawned ffmpeg process exited with a failure status.
    #[error("ffmpeg exited with {status}: {stderr}")]
    TrimFailed {
        /// Exit status reported by the ffmpeg process.
        status: std::process::ExitStatus,
        /// Trailing stderr output captured from ffmpeg.
        stderr: String,
    },
    /// Wraps [ffmpeg_next::Error].
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    /// Wraps [serde_json::Error].
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    /// Wraps [std::io::Error].
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
