use crate::video::{FrameSource, VideoInfo};
use crate::{Error, Result};

use super::{
    CancellationToken, FrameSampler, Fingerprinter, LengthPreference, LoopCandidate, LoopRanker,
    LoopScorer, PairSearcher, SampledFrame, SearchStrategy, MIN_LOOP_SECONDS,
};

/// The part of the video to analyse, in original frames or in seconds.
///
/// Explicit frame numbers take precedence over time values when both are present.
/// Unset bounds default to the whole video.
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchWindow {
    /// First frame to analyse.
    pub start_frame: Option<u64>,
    /// End of the analysis window (exclusive).
    pub end_frame: Option<u64>,
    /// Window start in seconds; ignored when `start_frame` is set.
    pub start_time: Option<f64>,
    /// Window end in seconds; ignored when `end_frame` is set.
    pub end_time: Option<f64>,
}

impl SearchWindow {
    fn resolve(&self, info: &VideoInfo) -> Result<(u64, u64)> {
        for t in [self.start_time, self.end_time].into_iter().flatten() {
            if !t.is_finite() || t < 0.0 {
                return Err(Error::InvalidRange(format!("negative time bound {}", t)));
            }
        }

        let start = self
            .start_frame
            .or_else(|| self.start_time.map(|t| (t * info.fps) as u64))
            .unwrap_or(0);
        let end = self
            .end_frame
            .or_else(|| self.end_time.map(|t| (t * info.fps) as u64))
            .unwrap_or(info.total_frames);

        // Clamp to the video, then reject a collapsed window.
        let start = start.min(info.total_frames.saturating_sub(1));
        let end = end.min(info.total_frames);
        if start >= end {
            return Err(Error::InvalidRange(format!(
                "analysis window [{}, {}) is empty",
                start, end
            )));
        }

        Ok((start, end))
    }
}

/// Single entry point to the loop-detection pipeline.
///
/// Orchestrates sampling, fingerprinting, pair search, scoring, and ranking. Each stage
/// consumes its input by reference and produces a new owned artifact; nothing is
/// written to disk and no state survives the call. Detection is deterministic: the same
/// input and parameters produce the same candidates regardless of worker count.
#[derive(Clone, Debug)]
pub struct LoopDetector {
    window: SearchWindow,
    stride: u32,
    max_analysis_dim: u32,
    threshold: f32,
    desired_length: LengthPreference,
    strategy: SearchStrategy,
    threading: bool,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self {
            window: SearchWindow::default(),
            stride: super::DEFAULT_STRIDE,
            max_analysis_dim: super::DEFAULT_MAX_ANALYSIS_DIM,
            threshold: super::DEFAULT_SIMILARITY_THRESHOLD,
            desired_length: LengthPreference::Auto,
            strategy: SearchStrategy::Hybrid,
            threading: true,
        }
    }
}

impl LoopDetector {
    /// Returns a new [LoopDetector] with the provided analysis `window`.
    pub fn with_window(mut self, window: SearchWindow) -> Self {
        self.window = window;
        self
    }

    /// Returns a new [LoopDetector] with the provided sampling `stride`.
    ///
    /// A larger stride shrinks the pair-search space quadratically; reported loop times
    /// stay exact because they derive from original frame numbers.
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Returns a new [LoopDetector] with the provided analysis resolution cap.
    pub fn with_max_analysis_dim(mut self, max_analysis_dim: u32) -> Self {
        self.max_analysis_dim = max_analysis_dim;
        self
    }

    /// Returns a new [LoopDetector] with the provided boundary similarity `threshold`.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns a new [LoopDetector] with the provided `desired_length`.
    pub fn with_desired_length(mut self, desired_length: LengthPreference) -> Self {
        self.desired_length = desired_length;
        self
    }

    /// Returns a new [LoopDetector] with the provided comparison `strategy`.
    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns a new [LoopDetector] with `threading` set to the provided value.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Runs the detection pipeline and returns loop candidates sorted by descending
    /// final score.
    ///
    /// An empty list means no loop met the criteria; it is not an error. The
    /// cancellation token is polled between stages and inside each stage; once tripped,
    /// partial results are discarded and [Error::Cancelled] is returned.
    pub fn detect_loops<S: FrameSource>(
        &self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoopCandidate>> {
        let span = tracing::span!(tracing::Level::TRACE, "detect_loops");
        let _enter = span.enter();

        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::InvalidRange(format!(
                "similarity threshold {} not in [0, 1]",
                self.threshold
            )));
        }

        let info = source.info();
        let (start, end) = self.window.resolve(&info)?;

        tracing::debug!(
            start,
            end,
            stride = self.stride,
            threshold = f64::from(self.threshold),
            strategy = %self.strategy,
            "starting loop detection"
        );

        cancel.check()?;
        let frames = FrameSampler::default()
            .with_stride(self.stride)
            .with_max_analysis_dim(self.max_analysis_dim)
            .sample(source, start, end, cancel)?;

        cancel.check()?;
        let fingerprints = Fingerprinter::default()
            .with_threading(self.threading)
            .run(&frames, cancel)?;

        cancel.check()?;
        let pairs = PairSearcher::default()
            .with_threshold(f64::from(self.threshold))
            .with_strategy(self.strategy)
            .with_threading(self.threading)
            .search(&fingerprints, cancel)?;

        cancel.check()?;
        let mut candidates = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            cancel.check()?;

            if pair.j as usize >= frames.len() {
                return Err(Error::InternalConsistency(format!(
                    "pair ({}, {}) references beyond {} sampled frames",
                    pair.i,
                    pair.j,
                    frames.len()
                )));
            }

            if let Some(candidate) = self.build_candidate(&frames, &fingerprints, pair, &info)? {
                candidates.push(candidate);
            }
        }

        tracing::debug!(num_candidates = candidates.len(), "assembled candidates");

        cancel.check()?;
        let ranked = LoopRanker::default()
            .with_desired_length(self.desired_length)
            .rank(candidates);

        tracing::debug!(num_loops = ranked.len(), "finished loop detection");

        Ok(ranked)
    }

    // Maps a sampled-index pair back to source-video terms and scores it. Pairs below
    // the hard minimum duration are discarded before the (comparatively expensive)
    // motion analysis.
    fn build_candidate(
        &self,
        frames: &[SampledFrame],
        fingerprints: &[super::Fingerprint],
        pair: &super::Pair,
        info: &VideoInfo,
    ) -> Result<Option<LoopCandidate>> {
        let start_frame = frames[pair.i as usize].original_index;
        let end_frame = frames[pair.j as usize].original_index;
        if start_frame >= end_frame {
            return Err(Error::InternalConsistency(format!(
                "frame mapping not increasing: {} -> {}",
                start_frame, end_frame
            )));
        }

        let frame_count = end_frame - start_frame;
        let duration = frame_count as f64 / info.fps;
        if duration < MIN_LOOP_SECONDS {
            return Ok(None);
        }

        let quality = LoopScorer.quality(fingerprints, pair);

        Ok(Some(LoopCandidate {
            start_frame,
            end_frame,
            start_time: start_frame as f64 / info.fps,
            end_time: end_frame as f64 / info.fps,
            duration,
            frame_count,
            similarity: pair.similarity,
            quality,
            final_score: 0.0,
            fps: info.fps,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::video::IndexedFrame;
    use image::RgbImage;

    const FPS: f64 = 30.0;

    fn noise_frame(seed: u64, width: u32, height: u32) -> RgbImage {
        let mut state = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        RgbImage::from_fn(width, height, |_, _| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let v = (state >> 33) as u8;
            image::Rgb([v, v, v])
        })
    }

    // Circularly shifts the columns of `base`. A 60-wide base shifted by `i % 60`
    // repeats with period exactly 60, and the frame-to-frame change depends only on
    // the shift distance, so every repeat candidate has a bit-identical motion
    // profile. That makes the expected winner an exact tie-break, not a coin toss.
    fn rolled_frame(base: &RgbImage, shift: u32) -> RgbImage {
        let (width, height) = base.dimensions();
        RgbImage::from_fn(width, height, |x, y| *base.get_pixel((x + shift) % width, y))
    }

    // In-memory video: a rolling 60-frame cycle followed by unique noise frames.
    struct PatternSource {
        frames: Vec<RgbImage>,
    }

    impl PatternSource {
        // The first `cycles` copies of a 60-frame cycle repeat byte for byte; the
        // remaining frames are unique noise.
        fn repeating_cycles(total: u64, cycles: u64) -> Self {
            let base = noise_frame(42, 60, 48);
            let pattern_span = 60 * cycles;
            let frames = (0..total)
                .map(|i| {
                    if i < pattern_span {
                        rolled_frame(&base, (i % 60) as u32)
                    } else {
                        noise_frame(100_000 + i, 60, 48)
                    }
                })
                .collect();
            Self { frames }
        }

        // Frames [0, 60) are identical to [60, 120); everything after is noise.
        fn repeating(total: u64) -> Self {
            Self::repeating_cycles(total, 2)
        }

        fn unique(total: u64) -> Self {
            Self {
                frames: (0..total).map(|i| noise_frame(200_000 + i, 60, 48)).collect(),
            }
        }
    }

    impl FrameSource for PatternSource {
        fn info(&self) -> VideoInfo {
            VideoInfo {
                total_frames: self.frames.len() as u64,
                fps: FPS,
                width: 60,
                height: 48,
                duration: self.frames.len() as f64 / FPS,
            }
        }

        fn read_frames(
            &mut self,
            start: u64,
            end: u64,
        ) -> Result<Box<dyn Iterator<Item = Result<IndexedFrame>> + '_>> {
            let end = end.min(self.frames.len() as u64);
            let frames: Vec<RgbImage> = self.frames[start as usize..end as usize].to_vec();
            Ok(Box::new(frames.into_iter().enumerate().map(move |(k, frame)| {
                Ok((start + k as u64, frame))
            })))
        }
    }

    // Yields an endless stream of frames, slowly. Used to verify that cancellation
    // interrupts a run stuck on a decoder.
    struct SlowSource;

    impl FrameSource for SlowSource {
        fn info(&self) -> VideoInfo {
            VideoInfo {
                total_frames: u64::MAX,
                fps: FPS,
                width: 16,
                height: 16,
                duration: f64::MAX,
            }
        }

        fn read_frames(
            &mut self,
            start: u64,
            _end: u64,
        ) -> Result<Box<dyn Iterator<Item = Result<IndexedFrame>> + '_>> {
            Ok(Box::new((start..).map(|i| {
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok((i, RgbImage::new(16, 16)))
            })))
        }
    }

    #[test]
    fn test_perfect_repeat_detected() {
        let mut source = PatternSource::repeating(150);
        let candidates = LoopDetector::default()
            .detect_loops(&mut source, &CancellationToken::new())
            .unwrap();
        assert!(!candidates.is_empty());

        let top = &candidates[0];
        assert_eq!(top.start_frame, 0);
        assert_eq!(top.end_frame, 60);
        assert!(top.similarity >= 0.99);
        assert_eq!(top.start_time, 0.0);
        assert!((top.end_time - 2.0).abs() < 1e-9);
        assert!((top.duration - 2.0).abs() < 1e-9);
        assert_eq!(top.frame_count, 60);
        assert_eq!(top.fps, FPS);
    }

    #[test]
    fn test_perfect_repeat_all_strategies() {
        for strategy in [
            SearchStrategy::FastHash,
            SearchStrategy::BatchSsim,
            SearchStrategy::Hybrid,
            SearchStrategy::Combined,
        ] {
            let mut source = PatternSource::repeating(150);
            let candidates = LoopDetector::default()
                .with_strategy(strategy)
                .detect_loops(&mut source, &CancellationToken::new())
                .unwrap();
            assert!(!candidates.is_empty(), "strategy {}", strategy);
            assert_eq!(candidates[0].start_frame, 0, "strategy {}", strategy);
            assert_eq!(candidates[0].end_frame, 60, "strategy {}", strategy);
        }
    }

    #[test]
    fn test_no_loop_in_unique_frames() {
        for strategy in [
            SearchStrategy::FastHash,
            SearchStrategy::BatchSsim,
            SearchStrategy::Hybrid,
        ] {
            let mut source = PatternSource::unique(100);
            let candidates = LoopDetector::default()
                .with_strategy(strategy)
                .with_threshold(0.95)
                .detect_loops(&mut source, &CancellationToken::new())
                .unwrap();
            assert!(candidates.is_empty(), "strategy {}", strategy);
        }
    }

    #[test]
    fn test_reported_times_survive_stride() {
        let reference = {
            let mut source = PatternSource::repeating(150);
            LoopDetector::default()
                .detect_loops(&mut source, &CancellationToken::new())
                .unwrap()
        };
        let strided = {
            let mut source = PatternSource::repeating(150);
            LoopDetector::default()
                .with_stride(5)
                .detect_loops(&mut source, &CancellationToken::new())
                .unwrap()
        };

        assert!(!strided.is_empty());
        let (a, b) = (&reference[0], &strided[0]);
        // The boundary may snap to the stride grid, but reported times stay within one
        // stride of the exact result and always satisfy time = frame / fps.
        let tolerance = 5.0 / FPS + 1e-9;
        assert!((a.start_time - b.start_time).abs() <= tolerance);
        assert!((a.end_time - b.end_time).abs() <= tolerance);
        for c in &strided {
            assert_eq!(c.start_time, c.start_frame as f64 / c.fps);
            assert_eq!(c.end_time, c.end_frame as f64 / c.fps);
        }
    }

    #[test]
    fn test_determinism() {
        let run = |threading: bool| {
            let mut source = PatternSource::repeating(150);
            LoopDetector::default()
                .with_threading(threading)
                .detect_loops(&mut source, &CancellationToken::new())
                .unwrap()
        };
        let first = run(true);
        let second = run(true);
        let sequential = run(false);

        assert_eq!(first.len(), second.len());
        assert_eq!(first.len(), sequential.len());
        for other in [&second, &sequential] {
            for (a, b) in first.iter().zip(other.iter()) {
                assert_eq!(a.start_frame, b.start_frame);
                assert_eq!(a.end_frame, b.end_frame);
                assert_eq!(a.similarity, b.similarity);
                assert_eq!(a.quality, b.quality);
                assert_eq!(a.final_score, b.final_score);
            }
        }
    }

    #[test]
    fn test_cancellation_interrupts_blocked_source() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            trip.cancel();
        });

        let started = std::time::Instant::now();
        let mut source = SlowSource;
        let result = LoopDetector::default().detect_loops(&mut source, &cancel);
        let elapsed = started.elapsed();

        handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(
            elapsed < std::time::Duration::from_millis(500),
            "cancellation took {:?}",
            elapsed
        );
    }

    #[test]
    fn test_top_candidates_are_distinct_and_sorted() {
        let mut source = PatternSource::repeating(150);
        let candidates = LoopDetector::default()
            .detect_loops(&mut source, &CancellationToken::new())
            .unwrap();
        assert!(candidates.len() >= 3);

        let top: Vec<_> = candidates.iter().take(3).collect();
        for window in top.windows(2) {
            assert!(window[0].final_score >= window[1].final_score);
            assert!(
                (window[0].start_frame, window[0].end_frame)
                    != (window[1].start_frame, window[1].end_frame)
            );
        }
    }

    #[test]
    fn test_window_resolution() {
        let info = VideoInfo {
            total_frames: 300,
            fps: FPS,
            width: 64,
            height: 48,
            duration: 10.0,
        };

        // Times convert through fps.
        let window = SearchWindow {
            start_time: Some(1.0),
            end_time: Some(4.0),
            ..Default::default()
        };
        assert_eq!(window.resolve(&info).unwrap(), (30, 120));

        // Explicit frames win over times.
        let window = SearchWindow {
            start_frame: Some(10),
            end_frame: Some(50),
            start_time: Some(1.0),
            end_time: Some(4.0),
        };
        assert_eq!(window.resolve(&info).unwrap(), (10, 50));

        // Bounds clamp to the video.
        let window = SearchWindow {
            end_frame: Some(10_000),
            ..Default::default()
        };
        assert_eq!(window.resolve(&info).unwrap(), (0, 300));

        // A collapsed window is an error.
        let window = SearchWindow {
            start_frame: Some(200),
            end_frame: Some(200),
            ..Default::default()
        };
        assert!(matches!(window.resolve(&info), Err(Error::InvalidRange(_))));

        let window = SearchWindow {
            start_time: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(window.resolve(&info), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_invalid_parameters() {
        let cancel = CancellationToken::new();

        let mut source = PatternSource::unique(50);
        assert!(matches!(
            LoopDetector::default()
                .with_threshold(1.5)
                .detect_loops(&mut source, &cancel),
            Err(Error::InvalidRange(_))
        ));

        let mut source = PatternSource::unique(50);
        assert!(matches!(
            LoopDetector::default()
                .with_stride(0)
                .detect_loops(&mut source, &cancel),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_length_preference_end_to_end() {
        // Three cycles offer loops of both 2s (60 frames) and 4s (120 frames).
        let mut source = PatternSource::repeating_cycles(220, 3);
        let candidates = LoopDetector::default()
            .with_desired_length(LengthPreference::Seconds(4.0))
            .detect_loops(&mut source, &CancellationToken::new())
            .unwrap();
        assert!(!candidates.is_empty());
        for c in &candidates {
            assert!((c.duration - 4.0).abs() <= 0.8 + 1e-9);
        }
        assert_eq!(candidates[0].start_frame, 0);
        assert_eq!(candidates[0].end_frame, 120);
    }
}
