// crates/kine-core/src/audio_sync.rs
//
// Sample-count corrector for the audio callback when audio is NOT the
// master clock. Maintains an exponentially weighted average of the
// audio-vs-master difference and, once the estimate is trustworthy,
// asks the resampler for slightly more or fewer samples (clamped to
// ±10 %) instead of truncating or padding.

use crate::sync::NOSYNC_THRESHOLD;

/// Measurements averaged before the estimate is acted on; the EWMA
/// weight converges over this many frames.
const DIFF_AVG_NB: u32 = 20;
/// Maximum correction applied to one frame's sample count.
const CORRECTION_PERCENT_MAX: f64 = 0.10;

pub struct SampleCorrector {
    coef:           f64,
    cum:            f64,
    avg_count:      u32,
    diff_threshold: f64,
}

impl SampleCorrector {
    /// `diff_threshold` is the smallest average worth correcting, in
    /// seconds — typically `hw_buffer_bytes / bytes_per_second`.
    pub fn new(diff_threshold: f64) -> Self {
        Self {
            coef:           ((0.01f64).ln() / DIFF_AVG_NB as f64).exp(),
            cum:            0.0,
            avg_count:      0,
            diff_threshold,
        }
    }

    /// Forget accumulated history (used after a discontinuity).
    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.avg_count = 0;
    }

    /// Given the current clock difference (audio − master, seconds) and
    /// the frame's sample count, return how many samples the resampler
    /// should produce.
    pub fn wanted_samples(&mut self, diff: f64, nb_samples: usize, freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
            // Too big to be drift; restart the estimator.
            self.reset();
            return nb_samples;
        }
        self.cum = diff + self.coef * self.cum;
        if self.avg_count < DIFF_AVG_NB {
            self.avg_count += 1;
            return nb_samples;
        }
        let avg = self.cum * (1.0 - self.coef);
        if avg.abs() < self.diff_threshold {
            return nb_samples;
        }
        let wanted = nb_samples as i64 + (diff * freq as f64) as i64;
        let min = (nb_samples as f64 * (1.0 - CORRECTION_PERCENT_MAX)) as i64;
        let max = (nb_samples as f64 * (1.0 + CORRECTION_PERCENT_MAX)) as i64;
        wanted.clamp(min, max).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: u32 = 48_000;

    fn warmed(diff: f64, threshold: f64) -> SampleCorrector {
        let mut c = SampleCorrector::new(threshold);
        for _ in 0..DIFF_AVG_NB {
            assert_eq!(c.wanted_samples(diff, 1024, FREQ), 1024);
        }
        c
    }

    #[test]
    fn no_correction_during_warmup() {
        let mut c = SampleCorrector::new(0.02);
        for _ in 0..DIFF_AVG_NB {
            assert_eq!(c.wanted_samples(0.5, 1024, FREQ), 1024);
        }
    }

    #[test]
    fn small_average_is_left_alone() {
        let mut c = warmed(0.001, 0.02);
        assert_eq!(c.wanted_samples(0.001, 1024, FREQ), 1024);
    }

    #[test]
    fn correction_is_clamped_to_ten_percent() {
        let mut c = warmed(0.5, 0.02);
        // 0.5 s at 48 kHz would be 24000 extra samples; clamp holds it
        // to +10 %.
        let w = c.wanted_samples(0.5, 1024, FREQ);
        assert_eq!(w, (1024.0_f64 * 1.10) as usize);

        let mut c = warmed(-0.5, 0.02);
        let w = c.wanted_samples(-0.5, 1024, FREQ);
        assert_eq!(w, (1024.0_f64 * 0.90) as usize);
    }

    #[test]
    fn modest_drift_requests_proportional_samples() {
        // 1 ms late at 48 kHz = 48 samples, inside the clamp window.
        let mut c = warmed(0.001, 0.0001);
        let w = c.wanted_samples(0.001, 1024, FREQ);
        assert_eq!(w, 1024 + 48);
    }

    #[test]
    fn discontinuity_resets_the_estimator() {
        let mut c = warmed(0.5, 0.02);
        // A jump past the no-sync threshold must not produce a correction
        // and must restart warmup.
        assert_eq!(c.wanted_samples(NOSYNC_THRESHOLD + 1.0, 1024, FREQ), 1024);
        assert_eq!(c.wanted_samples(0.5, 1024, FREQ), 1024); // warming again
    }
}
