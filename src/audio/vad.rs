//! # Voice Activity Detection
//!
//! Classifies a chunk of mono samples as speech or non-speech.
//!
//! ## Algorithm:
//! 1. **High-pass filter**: `y[i] = 0.95 * (y[i-1] + x[i] - x[i-1])` removes
//!    low-frequency rumble and DC offset. Filter state carries over between
//!    chunks so a chunk boundary does not produce a spurious step.
//! 2. **RMS energy** of the filtered signal.
//! 3. **Zero-crossing rate**: fraction of adjacent filtered samples whose
//!    product is negative.
//!
//! A chunk is voice only when the energy is above the threshold **and** the
//! ZCR lies strictly inside `(0.01, 0.35)`. Energy alone lets broadband noise
//! through, ZCR alone lets unvoiced bursts through.

/// High-pass filter coefficient.
const HIGH_PASS_ALPHA: f64 = 0.95;

/// Lower bound (exclusive) of the zero-crossing band treated as speech.
pub const MIN_SPEECH_ZCR: f64 = 0.01;

/// Upper bound (exclusive) of the zero-crossing band treated as speech.
pub const MAX_SPEECH_ZCR: f64 = 0.35;

/// Measurements for one analysed chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub rms: f64,
    pub zcr: f64,
    pub is_voice: bool,
}

impl VadDecision {
    fn silent() -> Self {
        Self {
            rms: 0.0,
            zcr: 0.0,
            is_voice: false,
        }
    }
}

/// Stateful energy + zero-crossing detector.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    /// Last input and output sample of the high-pass filter.
    prev: Option<(f64, f64)>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold as f64,
            prev: None,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold as f32
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold as f64;
    }

    /// Analyse one chunk. An empty chunk is never voice and leaves the
    /// filter state untouched.
    pub fn analyze(&mut self, samples: &[f32]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::silent();
        }

        let mut filtered = Vec::with_capacity(samples.len());
        let (mut prev_x, mut prev_y) = match self.prev {
            Some(state) => state,
            None => {
                // The very first sample passes straight through.
                let x0 = samples[0] as f64;
                filtered.push(x0);
                (x0, x0)
            }
        };

        for &sample in &samples[filtered.len()..] {
            let x = sample as f64;
            let y = HIGH_PASS_ALPHA * (prev_y + x - prev_x);
            filtered.push(y);
            prev_x = x;
            prev_y = y;
        }
        self.prev = Some((prev_x, prev_y));

        let energy = filtered.iter().map(|y| y * y).sum::<f64>() / filtered.len() as f64;
        let rms = energy.sqrt();

        let crossings = filtered
            .windows(2)
            .filter(|pair| pair[0] * pair[1] < 0.0)
            .count();
        let zcr = crossings as f64 / filtered.len() as f64;

        let is_voice = rms > self.threshold && zcr > MIN_SPEECH_ZCR && zcr < MAX_SPEECH_ZCR;

        VadDecision { rms, zcr, is_voice }
    }

    /// Forget filter history.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * std::f32::consts::PI * freq * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_tone_is_voice() {
        let mut vad = VoiceActivityDetector::new(0.02);
        let decision = vad.analyze(&sine(440.0, 0.3, 16_000, 1600));
        assert!(decision.rms > 0.02, "rms {}", decision.rms);
        assert!(decision.zcr > MIN_SPEECH_ZCR && decision.zcr < MAX_SPEECH_ZCR, "zcr {}", decision.zcr);
        assert!(decision.is_voice);
    }

    #[test]
    fn test_near_silence_is_not_voice() {
        let mut vad = VoiceActivityDetector::new(0.02);
        let decision = vad.analyze(&sine(440.0, 0.0005, 16_000, 1600));
        assert!(!decision.is_voice);

        let decision = vad.analyze(&vec![0.0; 1600]);
        assert!(!decision.is_voice);
        assert_eq!(decision.zcr, 0.0);
    }

    #[test]
    fn test_high_zcr_noise_is_not_voice() {
        // Alternating sign every sample: ZCR close to 1.0, far outside the band
        let mut vad = VoiceActivityDetector::new(0.02);
        let samples: Vec<f32> = (0..1600).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let decision = vad.analyze(&samples);
        assert!(decision.rms > 0.02);
        assert!(decision.zcr > MAX_SPEECH_ZCR);
        assert!(!decision.is_voice);
    }

    #[test]
    fn test_empty_chunk_keeps_state() {
        let mut vad = VoiceActivityDetector::new(0.02);
        vad.analyze(&[0.1, 0.2]);
        let before = vad.prev;
        let decision = vad.analyze(&[]);
        assert!(!decision.is_voice);
        assert_eq!(vad.prev, before);
    }

    #[test]
    fn test_filter_state_carries_across_chunks() {
        let tone = sine(440.0, 0.3, 16_000, 3200);

        let mut whole = VoiceActivityDetector::new(0.02);
        whole.analyze(&tone);

        let mut split = VoiceActivityDetector::new(0.02);
        split.analyze(&tone[..1600]);
        split.analyze(&tone[1600..]);

        let (wx, wy) = whole.prev.unwrap();
        let (sx, sy) = split.prev.unwrap();
        assert!((wx - sx).abs() < 1e-12);
        assert!((wy - sy).abs() < 1e-12);

        split.reset();
        assert!(split.prev.is_none());
    }

    #[test]
    fn test_threshold_is_configurable() {
        let tone = sine(440.0, 0.3, 16_000, 1600);
        let mut vad = VoiceActivityDetector::new(0.02);
        vad.set_threshold(0.9);
        assert!(!vad.analyze(&tone).is_voice);
        assert_eq!(vad.threshold(), 0.9);
    }
}
