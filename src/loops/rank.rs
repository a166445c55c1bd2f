use std::cmp::Ordering;
use std::fmt::Display;
use std::str::FromStr;

use super::{LoopCandidate, MIN_LOOP_SECONDS};

// Candidates further than this fraction from the desired length are dropped; closer
// ones are penalised proportionally, capped at MAX_LENGTH_PENALTY.
const MAX_LENGTH_DEVIATION: f64 = 0.2;
const MAX_LENGTH_PENALTY: f64 = 0.5;

// Longer loops carry more content: up to DURATION_BONUS_CAP is added, saturating at
// DURATION_BONUS_SCALE seconds.
const DURATION_BONUS_CAP: f64 = 0.1;
const DURATION_BONUS_SCALE: f64 = 10.0;

/// Desired loop length: a specific duration in seconds, or best available.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LengthPreference {
    /// No preference; rank purely on quality and the duration bonus.
    Auto,
    /// Prefer loops close to this duration, in seconds.
    Seconds(f64),
}

impl Default for LengthPreference {
    fn default() -> Self {
        Self::Auto
    }
}

impl FromStr for LengthPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<f64>() {
            Ok(secs) if secs > 0.0 && secs.is_finite() => Ok(Self::Seconds(secs)),
            _ => Err(format!(
                "invalid loop length {:?}: expected \"auto\" or a positive number of seconds",
                s
            )),
        }
    }
}

impl Display for LengthPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Seconds(secs) => write!(f, "{}", secs),
        }
    }
}

/// Applies the length preference and produces the final ordering.
///
/// This is the single place where length-based filtering happens: candidates shorter
/// than the hard minimum are dropped, and with a numeric preference so are candidates
/// deviating more than 20% from it. The surviving candidates get their `final_score`
/// assigned and are returned best first.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopRanker {
    desired_length: LengthPreference,
}

impl LoopRanker {
    /// Returns a new [LoopRanker] with the provided `desired_length`.
    pub fn with_desired_length(mut self, desired_length: LengthPreference) -> Self {
        self.desired_length = desired_length;
        self
    }

    /// Filters, scores, and sorts the candidates, best first.
    ///
    /// An empty result means no candidate met the criteria; it is not an error.
    pub fn rank(&self, candidates: Vec<LoopCandidate>) -> Vec<LoopCandidate> {
        let mut ranked: Vec<LoopCandidate> = candidates
            .into_iter()
            .filter(|c| c.duration >= MIN_LOOP_SECONDS)
            .filter(|c| match self.desired_length {
                LengthPreference::Auto => true,
                LengthPreference::Seconds(desired) => {
                    (c.duration - desired).abs() <= MAX_LENGTH_DEVIATION * desired
                }
            })
            .map(|mut c| {
                let mut score = c.quality;
                if let LengthPreference::Seconds(desired) = self.desired_length {
                    let penalty = (c.duration - desired).abs() / desired;
                    score *= 1.0 - penalty.min(MAX_LENGTH_PENALTY);
                }
                score += (c.duration / DURATION_BONUS_SCALE).min(DURATION_BONUS_CAP);
                c.final_score = score;
                c
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.start_frame.cmp(&b.start_frame))
                .then_with(|| a.end_frame.cmp(&b.end_frame))
        });

        ranked
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate(start: u64, end: u64, fps: f64, quality: f64) -> LoopCandidate {
        let duration = (end - start) as f64 / fps;
        LoopCandidate {
            start_frame: start,
            end_frame: end,
            start_time: start as f64 / fps,
            end_time: end as f64 / fps,
            duration,
            frame_count: end - start,
            similarity: quality,
            quality,
            final_score: 0.0,
            fps,
        }
    }

    #[test]
    fn test_length_preference_parsing() {
        assert_eq!("auto".parse::<LengthPreference>(), Ok(LengthPreference::Auto));
        assert_eq!("AUTO".parse::<LengthPreference>(), Ok(LengthPreference::Auto));
        assert_eq!(
            "4.5".parse::<LengthPreference>(),
            Ok(LengthPreference::Seconds(4.5))
        );
        assert!("0".parse::<LengthPreference>().is_err());
        assert!("-2".parse::<LengthPreference>().is_err());
        assert!("abc".parse::<LengthPreference>().is_err());
    }

    #[test]
    fn test_short_loops_dropped() {
        let ranked = LoopRanker::default().rank(vec![
            candidate(0, 10, 30.0, 0.99), // 0.33s, below the hard minimum
            candidate(0, 30, 30.0, 0.9),
        ]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].end_frame, 30);
    }

    #[test]
    fn test_numeric_preference_filters_by_deviation() {
        let ranker = LoopRanker::default().with_desired_length(LengthPreference::Seconds(2.0));
        let ranked = ranker.rank(vec![
            candidate(0, 60, 30.0, 0.9),  // 2.0s, kept
            candidate(0, 70, 30.0, 0.9),  // 2.33s, 17% off, kept
            candidate(0, 90, 30.0, 0.99), // 3.0s, 50% off, dropped
        ]);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|c| (c.duration - 2.0).abs() <= 0.4 + 1e-9));
    }

    #[test]
    fn test_length_preference_reorders() {
        // A 2s loop of quality 0.92 and a 5s loop of quality 0.95.
        let short = candidate(0, 60, 30.0, 0.92);
        let long = candidate(100, 250, 30.0, 0.95);

        let prefer_short = LoopRanker::default()
            .with_desired_length(LengthPreference::Seconds(2.0))
            .rank(vec![short.clone(), long.clone()]);
        assert_eq!(prefer_short.len(), 1);
        assert_eq!(prefer_short[0].start_frame, 0);

        let prefer_long = LoopRanker::default()
            .with_desired_length(LengthPreference::Seconds(5.0))
            .rank(vec![short, long]);
        assert_eq!(prefer_long.len(), 1);
        assert_eq!(prefer_long[0].start_frame, 100);
    }

    #[test]
    fn test_duration_bonus_capped() {
        let ranked = LoopRanker::default().rank(vec![candidate(0, 3000, 30.0, 1.0)]);
        assert!((ranked[0].final_score - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_auto_keeps_all_above_minimum() {
        let ranked = LoopRanker::default().rank(vec![
            candidate(0, 18, 30.0, 0.5), // 0.6s, bonus 0.06
            candidate(0, 300, 30.0, 0.5), // 10s, bonus capped at 0.1
        ]);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|c| c.duration >= MIN_LOOP_SECONDS));
        // The longer loop collects a larger duration bonus.
        assert_eq!(ranked[0].frame_count, 300);
    }

    #[test]
    fn test_final_score_bounds() {
        let ranked = LoopRanker::default()
            .with_desired_length(LengthPreference::Seconds(3.0))
            .rank(vec![
                candidate(0, 90, 30.0, 1.0),
                candidate(0, 100, 30.0, 0.8),
            ]);
        for c in &ranked {
            assert!(c.final_score >= 0.0);
            assert!(c.final_score <= 1.0 + DURATION_BONUS_CAP);
        }
    }
}
