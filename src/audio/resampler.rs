//! # Streaming Resampler
//!
//! Converts mono audio from the client's sample rate to the recognition rate.
//! Input arrives in arbitrarily sized chunks, so samples are buffered until a
//! full resampler block is available and leftover input is carried into the
//! next call. Resampler history is never reset between chunks.

use rubato::{FftFixedIn, Resampler};
use tracing::warn;

/// Block length in input samples: roughly 10 ms at the source rate.
fn block_len(in_hz: u32) -> usize {
    (in_hz as usize / 100).max(64)
}

pub struct StreamResampler {
    in_hz: u32,
    out_hz: u32,
    resampler: Option<FftFixedIn<f32>>,
    chunk_in: usize,
    in_buf: Vec<f32>,
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("in_hz", &self.in_hz)
            .field("out_hz", &self.out_hz)
            .field("buffered", &self.in_buf.len())
            .finish()
    }
}

impl StreamResampler {
    /// Build a resampler from `in_hz` to `out_hz`. Equal rates pass through.
    ///
    /// ## Returns:
    /// - **Err(String)**: rubato rejected the rate pair
    pub fn new(in_hz: u32, out_hz: u32) -> Result<Self, String> {
        let mut chunk_in = block_len(in_hz);
        let resampler = if in_hz == out_hz {
            None
        } else {
            let inner = FftFixedIn::<f32>::new(in_hz as usize, out_hz as usize, chunk_in, 1, 1)
                .map_err(|e| format!("Failed to create resampler {}->{}: {}", in_hz, out_hz, e))?;
            chunk_in = inner.input_frames_next();
            Some(inner)
        };

        Ok(Self {
            in_hz,
            out_hz,
            resampler,
            chunk_in,
            in_buf: Vec::with_capacity(chunk_in),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.in_hz
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed samples and return whatever output is ready.
    pub fn push(&mut self, mut src: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return src.to_vec();
        };

        let mut out = Vec::new();
        while !src.is_empty() {
            let space = self.chunk_in - self.in_buf.len();
            let take = space.min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == self.chunk_in {
                match resampler.process(&[&self.in_buf[..]], None) {
                    Ok(block) => out.extend_from_slice(&block[0]),
                    Err(e) => warn!("Resampler block dropped: {}", e),
                }
                self.in_buf.clear();
            }
        }
        out
    }

    /// Drop buffered input and filter history.
    pub fn reset(&mut self) {
        self.in_buf.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut resampler = StreamResampler::new(16_000, 16_000).unwrap();
        assert!(resampler.is_passthrough());
        let input = vec![0.1f32; 1600];
        assert_eq!(resampler.push(&input), input);
    }

    #[test]
    fn test_downsampling_keeps_ratio_across_chunks() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();
        assert!(!resampler.is_passthrough());

        // One second in 100 ms chunks
        let chunk: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
        let produced: usize = (0..10).map(|_| resampler.push(&chunk).len()).sum();

        assert!(produced > 15_000 && produced <= 16_000, "produced {}", produced);
    }

    #[test]
    fn test_small_chunks_are_buffered() {
        let mut resampler = StreamResampler::new(44_100, 16_000).unwrap();
        // Less than one block: nothing ready yet
        assert!(resampler.push(&[0.0; 100]).is_empty());
        resampler.reset();
        assert_eq!(resampler.input_rate(), 44_100);
    }
}
