//! Camera noise estimation.
//!
//! The detection thresholds scale with the thermal noise of the sensor,
//! estimated from the scatter of a sparse sample of luminance pixels across
//! the buffered frames. The sample stride of 499 is coprime to common frame
//! widths, so the sampled pixels spread quasi-uniformly over the frame.

use crate::ring::FrameRing;

/// Sample every Nth luminance pixel.
const PIXEL_STRIDE: usize = 499;

/// Frames inspected per estimate.
pub const NOISE_FRAMES: usize = 16;

/// Mean per-pixel standard deviation over a sparse sample of the ring.
///
/// Inspects the first `frame_count` slots of the ring (bounded by its
/// capacity), sampling every 499th pixel of each luminance plane.
#[must_use]
pub fn estimate_noise_level(ring: &FrameRing, frame_size: usize, frame_count: usize) -> f64 {
    let frame_count = frame_count.min(ring.capacity());
    let sample_count = frame_size / PIXEL_STRIDE;
    if frame_count == 0 || sample_count == 0 {
        return 0.0;
    }

    let mut sum = vec![0u64; sample_count];
    let mut sum_sq = vec![0u64; sample_count];
    for slot in 0..frame_count {
        let luma = &ring.frame(slot)[..frame_size];
        for (i, (s, s2)) in sum.iter_mut().zip(sum_sq.iter_mut()).enumerate() {
            let value = luma[i * PIXEL_STRIDE] as u64;
            *s += value;
            *s2 += value * value;
        }
    }

    let n = frame_count as f64;
    let mut sd_sum = 0.0;
    for i in 0..sample_count {
        let mean = sum[i] as f64 / n;
        let variance = (sum_sq[i] as f64 / n - mean * mean).max(0.0);
        sd_sum += variance.sqrt();
    }
    sd_sum / sample_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(frames: &[u8], capacity: usize, frame_bytes: usize) -> FrameRing {
        let mut ring = FrameRing::new(capacity, frame_bytes);
        for (slot, &value) in frames.iter().enumerate() {
            ring.frame_mut(slot).fill(value);
        }
        ring
    }

    #[test]
    fn test_constant_frames_have_zero_noise() {
        let frame_bytes = 4000 * 3 / 2;
        let ring = ring_of(&[40; 16], 16, frame_bytes);
        let noise = estimate_noise_level(&ring, 4000, 16);
        assert_eq!(noise, 0.0);
    }

    #[test]
    fn test_alternating_frames() {
        // Pixels alternate 40/60 between frames: mean 50, deviation 10.
        let frame_bytes = 4000 * 3 / 2;
        let values: Vec<u8> = (0..16).map(|i| if i % 2 == 0 { 40 } else { 60 }).collect();
        let ring = ring_of(&values, 16, frame_bytes);
        let noise = estimate_noise_level(&ring, 4000, 16);
        assert!((noise - 10.0).abs() < 1e-9, "noise = {noise}");
    }

    #[test]
    fn test_tiny_frame_yields_zero() {
        let ring = FrameRing::new(4, 120);
        // frame_size below the sample stride: no pixels to study
        assert_eq!(estimate_noise_level(&ring, 80, 4), 0.0);
    }
}
