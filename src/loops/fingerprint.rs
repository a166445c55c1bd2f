#[cfg(feature = "rayon")]
extern crate rayon;

use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::Result;

use super::{CancellationToken, SampledFrame};

/// Compact derived data used to compare two frames cheaply.
///
/// `hash64` is a perceptual average-hash over an 8×8 grayscale downscale: bit
/// `y·8 + x` is set iff the pixel at `(x, y)` exceeds the 8×8 mean. The tile is the
/// grayscale frame at analysis resolution and is shared read-only by the pair search
/// and the motion scorer. Identical input frames produce identical fingerprints bit
/// for bit.
#[derive(Clone, Debug)]
pub struct Fingerprint {
    /// 64-bit perceptual average-hash.
    pub hash64: u64,
    /// Grayscale tile at analysis resolution.
    pub tile: GrayImage,
    // Per-channel 256-bin RGB histograms, for the legacy combined strategy.
    pub(crate) histogram: [[u32; 256]; 3],
}

impl Fingerprint {
    /// Returns the Hamming distance between the two 64-bit hashes.
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        (self.hash64 ^ other.hash64).count_ones()
    }

    /// Returns the hash similarity `1 − d/64` in `[0, 1]`.
    pub fn hash_similarity(&self, other: &Self) -> f64 {
        1.0 - f64::from(self.hamming_distance(other)) / 64.0
    }
}

/// Computes a [Fingerprint] for every sampled frame.
#[derive(Clone, Debug)]
pub struct Fingerprinter {
    threading: bool,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self { threading: true }
    }
}

impl Fingerprinter {
    /// Returns a new [Fingerprinter] with `threading` set to the provided value.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Fingerprints all frames, preserving order.
    ///
    /// All tiles in a run end up with identical dimensions: should the sampler ever
    /// produce frames of varying sizes, every tile is resized to match the first.
    pub fn run(
        &self,
        frames: &[SampledFrame],
        cancel: &CancellationToken,
    ) -> Result<Vec<Fingerprint>> {
        let span = tracing::span!(tracing::Level::TRACE, "fingerprint_frames");
        let _enter = span.enter();

        let mut tiles: Vec<GrayImage> = Vec::new();
        if cfg!(feature = "rayon") && self.threading {
            #[cfg(feature = "rayon")]
            {
                tiles = frames
                    .par_iter()
                    .map(|frame| {
                        cancel.check()?;
                        Ok(image::imageops::grayscale(&frame.pixels))
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
        } else {
            tiles = frames
                .iter()
                .map(|frame| {
                    cancel.check()?;
                    Ok(image::imageops::grayscale(&frame.pixels))
                })
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(reference) = tiles.first().map(|t| t.dimensions()) {
            for tile in tiles.iter_mut() {
                if tile.dimensions() != reference {
                    *tile = image::imageops::resize(
                        tile,
                        reference.0,
                        reference.1,
                        FilterType::Triangle,
                    );
                }
            }
        }

        let build = |(frame, tile): (&SampledFrame, GrayImage)| -> Result<Fingerprint> {
            cancel.check()?;
            Ok(Fingerprint {
                hash64: average_hash(&tile),
                histogram: rgb_histograms(&frame.pixels),
                tile,
            })
        };

        let mut fingerprints: Vec<Fingerprint> = Vec::new();
        if cfg!(feature = "rayon") && self.threading {
            #[cfg(feature = "rayon")]
            {
                fingerprints = frames
                    .par_iter()
                    .zip(tiles.into_par_iter())
                    .map(build)
                    .collect::<Result<Vec<_>>>()?;
            }
        } else {
            fingerprints = frames
                .iter()
                .zip(tiles.into_iter())
                .map(build)
                .collect::<Result<Vec<_>>>()?;
        }

        tracing::debug!(count = fingerprints.len(), "fingerprinted frames");

        Ok(fingerprints)
    }
}

// 64-bit average-hash of the 8x8 downscale. The bit comparison is pure integer math
// (`pixel * 64 > sum` instead of `pixel > sum / 64`), so no float rounding can flip a
// bit.
fn average_hash(tile: &GrayImage) -> u64 {
    let small = image::imageops::resize(tile, 8, 8, FilterType::Triangle);
    let sum: u32 = small.pixels().map(|p| u32::from(p.0[0])).sum();

    let mut hash = 0u64;
    for (x, y, pixel) in small.enumerate_pixels() {
        if u32::from(pixel.0[0]) * 64 > sum {
            hash |= 1 << (y * 8 + x);
        }
    }
    hash
}

fn rgb_histograms(pixels: &RgbImage) -> [[u32; 256]; 3] {
    let mut histograms = [[0u32; 256]; 3];
    for pixel in pixels.pixels() {
        for channel in 0..3 {
            histograms[channel][usize::from(pixel.0[channel])] += 1;
        }
    }
    histograms
}
