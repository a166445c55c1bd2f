use image::GrayImage;

use super::{Fingerprint, Pair, MOTION_MIN_FRAMES, MOTION_SAMPLE_FRAMES};

// Weighting between boundary similarity and intra-loop motion consistency.
const SIMILARITY_WEIGHT: f64 = 0.7;
const MOTION_WEIGHT: f64 = 0.3;

/// Scores loop quality by combining boundary similarity with intra-loop motion
/// consistency.
///
/// A near-identical boundary with a chaotic middle makes a bad loop: the scorer samples
/// a handful of frames across the loop body and penalises candidates whose
/// frame-to-frame change bursts unevenly. Mean absolute difference is used instead of
/// SSIM inside the loop to avoid a second quadratic cost.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopScorer;

impl LoopScorer {
    /// Computes the quality score in `[0, 1]` for the loop spanned by `pair`.
    ///
    /// Loops spanning fewer than [MOTION_MIN_FRAMES] sampled frames score their raw
    /// boundary similarity.
    pub fn quality(&self, fingerprints: &[Fingerprint], pair: &Pair) -> f64 {
        let (i, j) = (pair.i as usize, pair.j as usize);
        let span = j - i + 1;
        if span < MOTION_MIN_FRAMES {
            return pair.similarity;
        }

        // Evenly spaced frames across [i, j], endpoints included.
        let samples: Vec<&GrayImage> = (0..MOTION_SAMPLE_FRAMES)
            .map(|k| &fingerprints[i + k * (span - 1) / (MOTION_SAMPLE_FRAMES - 1)].tile)
            .collect();

        let consistency = motion_consistency(&samples);
        (SIMILARITY_WEIGHT * pair.similarity + MOTION_WEIGHT * consistency).clamp(0.0, 1.0)
    }
}

// Mean absolute grayscale difference between consecutive sample frames; a low standard
// deviation relative to the mean indicates evenly distributed motion.
fn motion_consistency(samples: &[&GrayImage]) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }

    let differences: Vec<f64> = samples
        .windows(2)
        .map(|w| mean_absolute_difference(w[0], w[1]))
        .collect();

    let n = differences.len() as f64;
    let mean = differences.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 1.0;
    }

    let variance = differences
        .iter()
        .map(|d| (d - mean) * (d - mean))
        .sum::<f64>()
        / n;
    (1.0 - variance.sqrt() / mean).max(0.0)
}

fn mean_absolute_difference(a: &GrayImage, b: &GrayImage) -> f64 {
    let n = a.as_raw().len().min(b.as_raw().len());
    if n == 0 {
        return 0.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&va, &vb)| u64::from(va.abs_diff(vb)))
        .sum();
    total as f64 / n as f64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::loops::{CancellationToken, Fingerprinter, SampledFrame};
    use image::RgbImage;

    fn flat_frame(value: u8, index: u64) -> SampledFrame {
        SampledFrame {
            extracted_index: index as u32,
            original_index: index,
            pixels: RgbImage::from_pixel(64, 48, image::Rgb([value, value, value])),
        }
    }

    fn fingerprints(frames: &[SampledFrame]) -> Vec<Fingerprint> {
        Fingerprinter::default()
            .run(frames, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_short_loop_scores_raw_similarity() {
        let frames: Vec<_> = (0..10).map(|i| flat_frame(100, i)).collect();
        let prints = fingerprints(&frames);
        let pair = Pair {
            i: 0,
            j: 9,
            similarity: 0.97,
        };
        assert_eq!(LoopScorer.quality(&prints, &pair), 0.97);
    }

    #[test]
    fn test_static_loop_is_fully_consistent() {
        // Zero motion: mean difference is 0, consistency 1.
        let frames: Vec<_> = (0..20).map(|i| flat_frame(100, i)).collect();
        let prints = fingerprints(&frames);
        let pair = Pair {
            i: 0,
            j: 19,
            similarity: 1.0,
        };
        assert_eq!(LoopScorer.quality(&prints, &pair), 1.0);
    }

    #[test]
    fn test_even_motion_beats_bursty_motion() {
        // Brightness ramps evenly in one clip and jumps all at once in the other.
        let even: Vec<_> = (0..21).map(|i| flat_frame((i * 10) as u8, i)).collect();
        let bursty: Vec<_> = (0..21)
            .map(|i| flat_frame(if i < 20 { 0 } else { 200 }, i))
            .collect();

        let pair = Pair {
            i: 0,
            j: 20,
            similarity: 1.0,
        };
        let even_quality = LoopScorer.quality(&fingerprints(&even), &pair);
        let bursty_quality = LoopScorer.quality(&fingerprints(&bursty), &pair);
        assert!(
            even_quality > bursty_quality,
            "even {} should beat bursty {}",
            even_quality,
            bursty_quality
        );
    }

    #[test]
    fn test_quality_bounds() {
        let frames: Vec<_> = (0..15)
            .map(|i| flat_frame((i * 17 % 256) as u8, i))
            .collect();
        let prints = fingerprints(&frames);
        for j in [5u32, 11, 14] {
            let pair = Pair {
                i: 0,
                j,
                similarity: 1.0,
            };
            let quality = LoopScorer.quality(&prints, &pair);
            assert!((0.0..=1.0).contains(&quality));
        }
    }
}
