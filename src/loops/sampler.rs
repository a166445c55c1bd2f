use image::imageops::FilterType;
use image::RgbImage;

use crate::video::FrameSource;
use crate::{Error, Result};

use super::CancellationToken;

/// A frame kept for analysis, together with the bookkeeping needed to map it back to the
/// source video.
///
/// `original_index` is the frame number in the undecimated video; `extracted_index` is
/// the 0-based position in the sampled sequence. The mapping between the two is strictly
/// increasing and is the only source of truth for converting sampled indices back to
/// wall-clock times.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    /// 0-based position in the sampled sequence.
    pub extracted_index: u32,
    /// Frame number in the source video.
    pub original_index: u64,
    /// Analysis-resolution RGB pixels.
    pub pixels: RgbImage,
}

/// Extracts a strided, analysis-resolution frame sequence from a [FrameSource].
///
/// Frames are kept at `original_index = start, start + stride, start + 2·stride, …`
/// within the requested window. Each kept frame is downscaled so its longest edge does
/// not exceed the analysis cap; frames are never upscaled. Downsampling shrinks the
/// pair-search space quadratically, while the retained original indices keep the
/// reported loop times exact regardless of stride.
#[derive(Clone, Debug)]
pub struct FrameSampler {
    stride: u32,
    max_analysis_dim: u32,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self {
            stride: super::DEFAULT_STRIDE,
            max_analysis_dim: super::DEFAULT_MAX_ANALYSIS_DIM,
        }
    }
}

impl FrameSampler {
    /// Returns a new [FrameSampler] with the provided `stride`.
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Returns a new [FrameSampler] with the provided `max_analysis_dim`.
    pub fn with_max_analysis_dim(mut self, max_analysis_dim: u32) -> Self {
        self.max_analysis_dim = max_analysis_dim;
        self
    }

    /// Samples the half-open window `[start, end)` of original frame numbers.
    ///
    /// Fails with [Error::InvalidRange] when the window or stride is malformed and
    /// [Error::NoFrames] when a non-empty window produced no frames. A truncated stream
    /// ends the sequence early; frames are never fabricated. Decoder errors propagate
    /// without retry.
    pub fn sample<S: FrameSource>(
        &self,
        source: &mut S,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SampledFrame>> {
        let span = tracing::span!(tracing::Level::TRACE, "sample_frames");
        let _enter = span.enter();

        let total_frames = source.info().total_frames;
        if self.stride < 1 {
            return Err(Error::InvalidRange("stride must be at least 1".to_string()));
        }
        if start >= total_frames {
            return Err(Error::InvalidRange(format!(
                "start frame {} is beyond the last frame {}",
                start,
                total_frames.saturating_sub(1)
            )));
        }
        if start >= end {
            return Err(Error::InvalidRange(format!(
                "start frame {} is not before end frame {}",
                start, end
            )));
        }

        let stride = u64::from(self.stride);
        let mut sampled = Vec::new();
        let mut last_index = None;

        for item in source.read_frames(start, end)? {
            cancel.check()?;
            let (index, pixels) = item?;

            if let Some(last) = last_index {
                if index <= last {
                    return Err(Error::InternalConsistency(format!(
                        "frame numbers not increasing: {} after {}",
                        index, last
                    )));
                }
            }
            last_index = Some(index);

            if (index - start) % stride != 0 {
                continue;
            }

            sampled.push(SampledFrame {
                extracted_index: sampled.len() as u32,
                original_index: index,
                pixels: resize_for_analysis(pixels, self.max_analysis_dim),
            });
        }

        if sampled.is_empty() {
            return Err(Error::NoFrames);
        }

        tracing::debug!(
            kept = sampled.len(),
            stride = self.stride,
            "sampled window [{}, {})",
            start,
            end
        );

        Ok(sampled)
    }
}

// Downscales so that max(width, height) <= max_dim, preserving aspect ratio. The
// triangle filter averages over the source footprint when shrinking, which keeps the
// fingerprints stable against high-frequency noise. Never upscales.
fn resize_for_analysis(frame: RgbImage, max_dim: u32) -> RgbImage {
    let (width, height) = frame.dimensions();
    let longest = width.max(height);
    if longest <= max_dim {
        return frame;
    }

    let scale = f64::from(max_dim) / f64::from(longest);
    let new_width = ((f64::from(width) * scale).round() as u32).max(1);
    let new_height = ((f64::from(height) * scale).round() as u32).max(1);
    image::imageops::resize(&frame, new_width, new_height, FilterType::Triangle)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::video::{IndexedFrame, VideoInfo};

    struct StubSource {
        total_frames: u64,
        frame_size: (u32, u32),
        // Stop yielding after this many frames, simulating a truncated stream.
        truncate_after: Option<u64>,
        fail_at: Option<u64>,
    }

    impl StubSource {
        fn new(total_frames: u64) -> Self {
            Self {
                total_frames,
                frame_size: (64, 48),
                truncate_after: None,
                fail_at: None,
            }
        }

        fn frame(&self, index: u64) -> RgbImage {
            let v = (index % 251) as u8;
            RgbImage::from_pixel(self.frame_size.0, self.frame_size.1, image::Rgb([v, v, v]))
        }
    }

    impl FrameSource for StubSource {
        fn info(&self) -> VideoInfo {
            VideoInfo {
                total_frames: self.total_frames,
                fps: 30.0,
                width: self.frame_size.0,
                height: self.frame_size.1,
                duration: self.total_frames as f64 / 30.0,
            }
        }

        fn read_frames(
            &mut self,
            start: u64,
            end: u64,
        ) -> Result<Box<dyn Iterator<Item = Result<IndexedFrame>> + '_>> {
            let end = end.min(self.total_frames);
            let limit = self.truncate_after;
            let fail_at = self.fail_at;
            let frames: Vec<_> = (start..end).collect();
            let mut yielded = 0u64;
            Ok(Box::new(frames.into_iter().filter_map(move |i| {
                if let Some(limit) = limit {
                    if yielded >= limit {
                        return None;
                    }
                }
                yielded += 1;
                if fail_at == Some(i) {
                    return Some(Err(Error::Decoder("stream corrupted".to_string())));
                }
                Some(Ok((i, self.frame(i))))
            })))
        }
    }

    #[test]
    fn test_index_mapping_is_arithmetic() {
        let mut source = StubSource::new(100);
        for stride in [1u32, 2, 5, 10] {
            let sampler = FrameSampler::default().with_stride(stride);
            let frames = sampler
                .sample(&mut source, 10, 90, &CancellationToken::new())
                .unwrap();
            for (k, frame) in frames.iter().enumerate() {
                assert_eq!(frame.extracted_index, k as u32);
                assert_eq!(frame.original_index, 10 + k as u64 * u64::from(stride));
            }
        }
    }

    #[test]
    fn test_invalid_ranges() {
        let mut source = StubSource::new(100);
        let sampler = FrameSampler::default();
        let cancel = CancellationToken::new();
        assert!(matches!(
            sampler.sample(&mut source, 100, 120, &cancel),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            sampler.sample(&mut source, 50, 50, &cancel),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            sampler.sample(&mut source, 60, 50, &cancel),
            Err(Error::InvalidRange(_))
        ));
        let sampler = FrameSampler::default().with_stride(0);
        assert!(matches!(
            sampler.sample(&mut source, 0, 50, &cancel),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_truncated_stream_stops_early() {
        let mut source = StubSource::new(100);
        source.truncate_after = Some(25);
        let sampler = FrameSampler::default();
        let frames = sampler
            .sample(&mut source, 0, 100, &CancellationToken::new())
            .unwrap();
        assert_eq!(frames.len(), 25);
        assert_eq!(frames.last().unwrap().original_index, 24);
    }

    #[test]
    fn test_empty_stream_is_no_frames() {
        let mut source = StubSource::new(100);
        source.truncate_after = Some(0);
        let sampler = FrameSampler::default();
        assert!(matches!(
            sampler.sample(&mut source, 0, 100, &CancellationToken::new()),
            Err(Error::NoFrames)
        ));
    }

    #[test]
    fn test_decoder_error_propagates() {
        let mut source = StubSource::new(100);
        source.fail_at = Some(3);
        let sampler = FrameSampler::default();
        assert!(matches!(
            sampler.sample(&mut source, 0, 100, &CancellationToken::new()),
            Err(Error::Decoder(_))
        ));
    }

    #[test]
    fn test_downscale_preserves_aspect_and_never_upscales() {
        let big = RgbImage::new(1920, 1080);
        let small = resize_for_analysis(big, 480);
        assert_eq!(small.dimensions(), (480, 270));

        let tiny = RgbImage::new(320, 200);
        let kept = resize_for_analysis(tiny, 480);
        assert_eq!(kept.dimensions(), (320, 200));

        let tall = RgbImage::new(240, 960);
        let resized = resize_for_analysis(tall, 480);
        assert_eq!(resized.dimensions(), (120, 480));
    }

    #[test]
    fn test_cancellation() {
        let mut source = StubSource::new(100);
        let sampler = FrameSampler::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            sampler.sample(&mut source, 0, 100, &cancel),
            Err(Error::Cancelled)
        ));
    }
}
