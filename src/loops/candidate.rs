use std::fmt::Display;

/// A detected loop, expressed entirely in source-video terms.
///
/// Frame fields always refer to the undecimated video, regardless of the sampling
/// stride used during detection; time fields are `frame / fps`. The loop plays frames
/// `start_frame..end_frame` and wraps back to `start_frame`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct LoopCandidate {
    /// First frame of the loop in the source video.
    pub start_frame: u64,
    /// Last (boundary) frame of the loop in the source video.
    pub end_frame: u64,
    /// Loop start in seconds.
    pub start_time: f64,
    /// Loop end in seconds.
    pub end_time: f64,
    /// Loop duration in seconds.
    pub duration: f64,
    /// Number of source frames the loop spans.
    pub frame_count: u64,
    /// Boundary similarity in `[0, 1]`.
    #[serde(rename = "similarity_score")]
    pub similarity: f64,
    /// Quality score in `[0, 1]`: boundary similarity blended with motion consistency.
    #[serde(rename = "quality_score")]
    pub quality: f64,
    /// Ranking key: quality after length-preference shaping and the duration bonus.
    pub final_score: f64,
    /// Source frame rate.
    pub fps: f64,
}

impl Display for LoopCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}s - {:.2}s ({:.2}s, {} frames, similarity {:.3}, quality {:.3}, score {:.3})",
            self.start_time,
            self.end_time,
            self.duration,
            self.frame_count,
            self.similarity,
            self.quality,
            self.final_score,
        )
    }
}
