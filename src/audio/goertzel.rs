//! Single-frequency tone detection via the Goertzel recurrence.
//! Only one spectral bin is of interest, so this is O(N) per block against
//! an FFT's O(N log N), and it runs continuously during the lowest-power
//! phase of the system. A detection must survive a consecutive-block
//! debounce before the confirmation fires, filtering transient noise that
//! happens to carry energy at the target frequency.

use std::f32::consts::PI;

/// Immutable detector configuration, fixed for the detector's lifetime.
#[derive(Debug, Clone)]
pub struct ToneConfig {
    /// Frequency to watch, Hz.
    pub target_hz: f32,
    /// Capture rate, Hz. Kept low for power efficiency.
    pub sample_rate: u32,
    /// Samples per analyzed block.
    pub block_size: usize,
    /// Normalized magnitude above which a block counts as a hit.
    pub threshold: f32,
    /// Consecutive hit blocks required for a confirmed detection.
    pub confirm_blocks: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            target_hz: 1000.0,
            sample_rate: 8000,
            block_size: 256,
            threshold: 0.3,
            confirm_blocks: 3,
        }
    }
}

/// Outcome of one processed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Below threshold; the consecutive counter was reset.
    Miss,
    /// Above threshold but the debounce is not yet satisfied.
    Hit,
    /// Confirmed detection; fires once, then the counter resets.
    Confirmed,
}

/// Streaming Goertzel analyzer. The recurrence accumulator (s0, s1, s2) is
/// block-scoped and starts at zero for every call; only the hit counter
/// carries across blocks.
pub struct GoertzelDetector {
    config: ToneConfig,
    /// 2·cos(2π·k/N), precomputed once for the target bin.
    coeff: f32,
    cos_omega: f32,
    sin_omega: f32,
    consecutive_hits: u32,
}

impl GoertzelDetector {
    pub fn new(config: ToneConfig) -> Self {
        let k = (config.target_hz * config.block_size as f32 / config.sample_rate as f32).round();
        let omega = 2.0 * PI * k / config.block_size as f32;
        Self {
            coeff: 2.0 * omega.cos(),
            cos_omega: omega.cos(),
            sin_omega: omega.sin(),
            consecutive_hits: 0,
            config,
        }
    }

    /// Normalized magnitude of the target bin over one block of PCM.
    pub fn magnitude(&self, samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut s1 = 0.0f32;
        let mut s2 = 0.0f32;
        for &sample in samples {
            let x = sample as f32 / 32768.0;
            let s0 = x + self.coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        let real = s1 - s2 * self.cos_omega;
        let imag = s2 * self.sin_omega;
        (real * real + imag * imag).sqrt() / samples.len() as f32
    }

    /// Feed one block through detection and the debounce.
    pub fn process_block(&mut self, samples: &[i16]) -> BlockOutcome {
        let magnitude = self.magnitude(samples);
        if magnitude > self.config.threshold {
            self.consecutive_hits += 1;
            if self.consecutive_hits >= self.config.confirm_blocks {
                self.consecutive_hits = 0;
                return BlockOutcome::Confirmed;
            }
            BlockOutcome::Hit
        } else {
            self.consecutive_hits = 0;
            BlockOutcome::Miss
        }
    }

    /// Drop a partial hit streak (used when re-arming).
    pub fn reset(&mut self) {
        self.consecutive_hits = 0;
    }

    pub fn config(&self) -> &ToneConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthesize one block of a pure sine at `freq_hz`.
    fn tone_block(config: &ToneConfig, freq_hz: f32, amplitude: f32) -> Vec<i16> {
        (0..config.block_size)
            .map(|i| {
                let phase = 2.0 * PI * freq_hz * i as f32 / config.sample_rate as f32;
                (amplitude * 32767.0 * phase.sin()) as i16
            })
            .collect()
    }

    fn detector() -> GoertzelDetector {
        GoertzelDetector::new(ToneConfig::default())
    }

    #[test]
    fn target_tone_magnitude_clears_threshold() {
        let det = detector();
        let block = tone_block(det.config(), 1000.0, 0.8);
        // A pure tone at the bin lands near amplitude/2 after normalization.
        let magnitude = det.magnitude(&block);
        assert!(magnitude > 0.3, "magnitude {magnitude} too low");
        assert!(magnitude < 0.5, "magnitude {magnitude} implausibly high");
    }

    #[test]
    fn off_frequency_tone_is_rejected() {
        let det = detector();
        let block = tone_block(det.config(), 2000.0, 0.8);
        assert!(det.magnitude(&block) < 0.05);
    }

    #[test]
    fn quiet_tone_is_not_a_hit() {
        let mut det = detector();
        let block = tone_block(det.config(), 1000.0, 0.1);
        assert_eq!(det.process_block(&block), BlockOutcome::Miss);
    }

    #[test]
    fn silence_and_empty_blocks_miss() {
        let mut det = detector();
        let silence = vec![0i16; det.config().block_size];
        assert_eq!(det.process_block(&silence), BlockOutcome::Miss);
        assert_eq!(det.process_block(&[]), BlockOutcome::Miss);
    }

    #[test]
    fn two_hits_then_miss_does_not_confirm() {
        let mut det = detector();
        let hit = tone_block(det.config(), 1000.0, 0.8);
        let miss = vec![0i16; det.config().block_size];

        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
        assert_eq!(det.process_block(&miss), BlockOutcome::Miss);
        // Counter restarted: two more hits still do not confirm.
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
    }

    #[test]
    fn three_consecutive_hits_confirm_exactly_once() {
        let mut det = detector();
        let hit = tone_block(det.config(), 1000.0, 0.8);

        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
        assert_eq!(det.process_block(&hit), BlockOutcome::Confirmed);
        // Counter reset after firing: the next block is a fresh streak.
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
    }

    #[test]
    fn sustained_tone_reconfirms_every_streak() {
        let mut det = detector();
        let hit = tone_block(det.config(), 1000.0, 0.8);
        let confirmations = (0..6)
            .filter(|_| det.process_block(&hit) == BlockOutcome::Confirmed)
            .count();
        assert_eq!(confirmations, 2);
    }

    #[test]
    fn reset_drops_partial_streak() {
        let mut det = detector();
        let hit = tone_block(det.config(), 1000.0, 0.8);
        det.process_block(&hit);
        det.process_block(&hit);
        det.reset();
        assert_eq!(det.process_block(&hit), BlockOutcome::Hit);
    }
}
