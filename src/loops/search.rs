#[cfg(feature = "rayon")]
extern crate rayon;

use std::cmp::Ordering;
use std::fmt::Display;

use image::imageops::FilterType;
use image::GrayImage;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{Error, Result};

use super::{CancellationToken, Fingerprint};

// Hybrid pre-filter: the hash pass runs at `max(HASH_PREFILTER_FLOOR, τ - RELAX)` and
// survivors are re-scored with SSIM.
const HASH_PREFILTER_FLOOR: f64 = 0.8;
const HASH_PREFILTER_RELAX: f64 = 0.1;
const HYBRID_HASH_WEIGHT: f64 = 0.3;
const HYBRID_SSIM_WEIGHT: f64 = 0.7;
const COMBINED_SSIM_WEIGHT: f64 = 0.6;
const COMBINED_HISTOGRAM_WEIGHT: f64 = 0.4;

// Classical single-window SSIM constants.
const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

/// Frame-pair comparison strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum, serde::Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Hamming similarity between the 64-bit perceptual hashes. Cheapest.
    FastHash,
    /// Single-window SSIM between the grayscale tiles. Most precise, most expensive.
    BatchSsim,
    /// Hash pre-filter at a relaxed threshold, then SSIM verification of the survivors.
    Hybrid,
    /// Legacy scoring: `0.6·SSIM + 0.4·histogram correlation` for every pair.
    Combined,
}

impl Display for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SearchStrategy::FastHash => "fast_hash",
            SearchStrategy::BatchSsim => "batch_ssim",
            SearchStrategy::Hybrid => "hybrid",
            SearchStrategy::Combined => "combined",
        };
        write!(f, "{}", name)
    }
}

/// A candidate loop boundary: frames `i` and `j` of the sampled sequence look alike.
///
/// Both fields are extracted indices with `i < j`; the loop body is the inclusive range
/// `[i, j]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pair {
    /// Extracted index of the loop start frame.
    pub i: u32,
    /// Extracted index of the loop end frame.
    pub j: u32,
    /// Boundary similarity in `[0, 1]`.
    pub similarity: f64,
}

/// Enumerates the upper-triangular frame-pair space and keeps pairs whose similarity
/// meets the threshold.
///
/// All strategies make O(N²) comparisons; the hybrid pre-filter only shrinks the
/// constant factor of the SSIM step. Above ~2000 sampled frames, raise the sampler
/// stride instead. Workers emit into per-row buffers and a single deterministic sort
/// runs at stage end, so the result never depends on scheduling.
#[derive(Clone, Debug)]
pub struct PairSearcher {
    threshold: f64,
    strategy: SearchStrategy,
    threading: bool,
}

impl Default for PairSearcher {
    fn default() -> Self {
        Self {
            threshold: f64::from(super::DEFAULT_SIMILARITY_THRESHOLD),
            strategy: SearchStrategy::Hybrid,
            threading: true,
        }
    }
}

impl PairSearcher {
    /// Returns a new [PairSearcher] with the provided similarity `threshold`.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns a new [PairSearcher] with the provided `strategy`.
    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns a new [PairSearcher] with `threading` set to the provided value.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Searches all pairs `(i, j)` with `i < j`, returning those with similarity at or
    /// above the threshold, sorted by `(similarity desc, i asc, j asc)`.
    ///
    /// An empty result means no pair met the threshold; it is not an error.
    pub fn search(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<Vec<Pair>> {
        let span = tracing::span!(tracing::Level::TRACE, "pair_search");
        let _enter = span.enter();

        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::InvalidRange(format!(
                "similarity threshold {} not in [0, 1]",
                self.threshold
            )));
        }

        let mut pairs = match self.strategy {
            SearchStrategy::FastHash => {
                self.scan_rows(fingerprints, cancel, self.threshold, |a, b| {
                    a.hash_similarity(b)
                })?
            }
            SearchStrategy::BatchSsim => {
                self.scan_rows(fingerprints, cancel, self.threshold, |a, b| {
                    ssim(&a.tile, &b.tile)
                })?
            }
            SearchStrategy::Hybrid => self.search_hybrid(fingerprints, cancel)?,
            SearchStrategy::Combined => {
                self.scan_rows(fingerprints, cancel, self.threshold, |a, b| {
                    let ssim_score = ssim(&a.tile, &b.tile);
                    let histogram_score = histogram_correlation(&a.histogram, &b.histogram);
                    (COMBINED_SSIM_WEIGHT * ssim_score + COMBINED_HISTOGRAM_WEIGHT * histogram_score)
                        .clamp(0.0, 1.0)
                })?
            }
        };

        sort_pairs(&mut pairs);

        tracing::debug!(
            num_pairs = pairs.len(),
            strategy = %self.strategy,
            "finished pair search"
        );

        Ok(pairs)
    }

    // Scans one row of the upper-triangular pair matrix per work item. Cancellation is
    // polled once per row.
    fn scan_rows<F>(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
        threshold: f64,
        score: F,
    ) -> Result<Vec<Pair>>
    where
        F: Fn(&Fingerprint, &Fingerprint) -> f64 + Sync,
    {
        let n = fingerprints.len();

        let scan_row = |i: usize| -> Result<Vec<Pair>> {
            cancel.check()?;
            let mut row = Vec::new();
            for j in (i + 1)..n {
                let similarity = score(&fingerprints[i], &fingerprints[j]);
                if similarity >= threshold {
                    row.push(Pair {
                        i: i as u32,
                        j: j as u32,
                        similarity,
                    });
                }
            }
            Ok(row)
        };

        let rows: Vec<Vec<Pair>>;
        if cfg!(feature = "rayon") && self.threading {
            #[cfg(feature = "rayon")]
            {
                rows = (0..n)
                    .into_par_iter()
                    .map(scan_row)
                    .collect::<Result<Vec<_>>>()?;
            }
            #[cfg(not(feature = "rayon"))]
            {
                unreachable!()
            }
        } else {
            rows = (0..n).map(scan_row).collect::<Result<Vec<_>>>()?;
        }

        Ok(rows.into_iter().flatten().collect())
    }

    // Hash pre-filter at a relaxed threshold, then SSIM verification. Every emitted
    // pair also appears in a plain fast_hash run at the relaxed threshold.
    fn search_hybrid(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancellationToken,
    ) -> Result<Vec<Pair>> {
        let relaxed = (self.threshold - HASH_PREFILTER_RELAX).max(HASH_PREFILTER_FLOOR);
        let candidates = self.scan_rows(fingerprints, cancel, relaxed, |a, b| {
            a.hash_similarity(b)
        })?;

        tracing::debug!(
            candidates = candidates.len(),
            relaxed_threshold = relaxed,
            "hash pre-filter complete"
        );

        let verify = |pair: &Pair| -> Result<Option<Pair>> {
            cancel.check()?;
            let (a, b) = (&fingerprints[pair.i as usize], &fingerprints[pair.j as usize]);
            let ssim_score = ssim(&a.tile, &b.tile);
            if ssim_score < self.threshold {
                return Ok(None);
            }
            Ok(Some(Pair {
                similarity: HYBRID_HASH_WEIGHT * pair.similarity + HYBRID_SSIM_WEIGHT * ssim_score,
                ..*pair
            }))
        };

        let verified: Vec<Option<Pair>>;
        if cfg!(feature = "rayon") && self.threading {
            #[cfg(feature = "rayon")]
            {
                verified = candidates
                    .par_iter()
                    .map(verify)
                    .collect::<Result<Vec<_>>>()?;
            }
            #[cfg(not(feature = "rayon"))]
            {
                unreachable!()
            }
        } else {
            verified = candidates.iter().map(verify).collect::<Result<Vec<_>>>()?;
        }

        Ok(verified.into_iter().flatten().collect())
    }
}

fn sort_pairs(pairs: &mut [Pair]) {
    pairs.sort_unstable_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.i.cmp(&b.i))
            .then_with(|| a.j.cmp(&b.j))
    });
}

/// Single-window SSIM between two grayscale tiles, clamped to `[0, 1]`.
///
/// Uses the classical formula over whole-tile statistics. Tiles of mismatched size are
/// brought to the first tile's dimensions before comparison.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    let resized;
    let b = if a.dimensions() != b.dimensions() {
        resized = image::imageops::resize(b, a.width(), a.height(), FilterType::Triangle);
        &resized
    } else {
        b
    };

    let n = (a.width() * a.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }

    let (mut sum_a, mut sum_b, mut sum_aa, mut sum_bb, mut sum_ab) = (0f64, 0f64, 0f64, 0f64, 0f64);
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let (va, vb) = (f64::from(pa.0[0]), f64::from(pb.0[0]));
        sum_a += va;
        sum_b += vb;
        sum_aa += va * va;
        sum_bb += vb * vb;
        sum_ab += va * vb;
    }

    let mu_a = sum_a / n;
    let mu_b = sum_b / n;
    let var_a = (sum_aa / n - mu_a * mu_a).max(0.0);
    let var_b = (sum_bb / n - mu_b * mu_b).max(0.0);
    let cov = sum_ab / n - mu_a * mu_b;

    let numerator = (2.0 * mu_a * mu_b + SSIM_C1) * (2.0 * cov + SSIM_C2);
    let denominator = (mu_a * mu_a + mu_b * mu_b + SSIM_C1) * (var_a + var_b + SSIM_C2);

    if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// Mean across RGB channels of the Pearson correlation between 256-bin histograms. A
// zero-variance channel correlates 1.0 only with another zero-variance channel.
pub(crate) fn histogram_correlation(a: &[[u32; 256]; 3], b: &[[u32; 256]; 3]) -> f64 {
    let mut total = 0.0;
    for channel in 0..3 {
        total += pearson(&a[channel], &b[channel]);
    }
    total / 3.0
}

fn pearson(a: &[u32; 256], b: &[u32; 256]) -> f64 {
    let n = 256.0;
    let mean_a = a.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

    let (mut num, mut den_a, mut den_b) = (0f64, 0f64, 0f64);
    for (&va, &vb) in a.iter().zip(b.iter()) {
        let da = f64::from(va) - mean_a;
        let db = f64::from(vb) - mean_b;
        num += da * db;
        den_a += da * da;
        den_b += db * db;
    }

    if den_a == 0.0 || den_b == 0.0 {
        if den_a == 0.0 && den_b == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        num / (den_a * den_b).sqrt()
    }
}
