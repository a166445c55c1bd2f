mod candidate;
mod detector;
mod fingerprint;
mod rank;
mod sampler;
mod score;
mod search;

pub use candidate::LoopCandidate;
pub use detector::{LoopDetector, SearchWindow};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use rank::{LengthPreference, LoopRanker};
pub use sampler::{FrameSampler, SampledFrame};
pub use score::LoopScorer;
pub use search::{Pair, PairSearcher, SearchStrategy};

/// Default boundary similarity threshold.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.98;
/// Default sampling stride (keep every frame).
pub const DEFAULT_STRIDE: u32 = 1;
/// Default longest-edge cap for analysis frames, in pixels.
pub const DEFAULT_MAX_ANALYSIS_DIM: u32 = 480;
/// Hard lower bound on loop duration, in seconds.
pub const MIN_LOOP_SECONDS: f64 = 0.5;
/// Minimum sampled frames in a loop before motion consistency participates in quality.
pub const MOTION_MIN_FRAMES: usize = 11;
/// Number of evenly spaced frames sampled for motion analysis.
pub const MOTION_SAMPLE_FRAMES: usize = 5;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal for a detection run.
///
/// The token is polled between pipeline stages and inside each stage at loop
/// granularity. Once tripped, the run discards partial results and surfaces
/// [Cancelled](crate::Error::Cancelled).
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token. All clones observe the cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
