//! Rolling model of the sky background.
//!
//! A histogram of the value of every pixel-channel is accumulated over a few
//! thousand frames; reducing it to a per-pixel modal image gives the sky
//! brightness with stars, hot pixels and light pollution baked in. The map
//! is subtracted from time-lapse stacks and refreshed continuously. Reducing
//! a histogram of every pixel at once would stall the frame loop, so the
//! reduction is spread across a configurable number of consecutive frames,
//! each handling one contiguous span of pixels.

/// Per-pixel-channel histogram and the background maps reduced from it.
pub struct BackgroundModel {
    /// Pixels * channels covered by each map.
    len: usize,
    window_frames: usize,
    reduction_cycles: usize,
    /// `len * 256` bin counters, bins contiguous per pixel-channel.
    histogram: Vec<u32>,
    /// Map under construction by the chunked reduction.
    pending: Vec<u8>,
    /// Completed maps, most recent first. Index 0 is used for subtraction.
    maps: Vec<Vec<u8>>,
    frames_accumulated: usize,
}

impl BackgroundModel {
    /// Allocate a model over `len` pixel-channels.
    ///
    /// `window_frames` frames are histogrammed before a reduction begins;
    /// the reduction is spread over `reduction_cycles` calls; `samples`
    /// completed maps are retained.
    ///
    /// # Panics
    ///
    /// Panics if any argument is zero.
    #[must_use]
    pub fn new(len: usize, window_frames: usize, samples: usize, reduction_cycles: usize) -> Self {
        assert!(len > 0 && window_frames > 0 && samples > 0 && reduction_cycles > 0);
        Self {
            len,
            window_frames,
            reduction_cycles,
            histogram: vec![0; len * 256],
            pending: vec![0; len],
            maps: vec![vec![0; len]; samples],
            frames_accumulated: 0,
        }
    }

    /// Frames accumulated per reduction window.
    #[must_use]
    pub fn window_frames(&self) -> usize {
        self.window_frames
    }

    /// The most recently completed background map.
    #[must_use]
    pub fn map(&self) -> &[u8] {
        &self.maps[0]
    }

    /// Add one frame's channel planes into the histogram.
    pub fn accumulate(&mut self, channels: &[u8]) {
        debug_assert_eq!(channels.len(), self.len);
        for (i, &value) in channels.iter().enumerate() {
            self.histogram[i * 256 + value as usize] += 1;
        }
        self.frames_accumulated += 1;
    }

    /// Run the reduction chunk due this frame, if any.
    ///
    /// Once the accumulation window is full, each call reduces one span of
    /// the pixel range; when all spans are done the new map is rotated in at
    /// index 0, the histogram is zeroed and a fresh window begins. Returns
    /// true on the call that promotes a new map.
    pub fn advance(&mut self) -> bool {
        if self.frames_accumulated < self.window_frames {
            return false;
        }
        let cycle = self.frames_accumulated - self.window_frames;
        self.reduce_span(cycle);
        if cycle >= self.reduction_cycles {
            self.promote();
            return true;
        }
        false
    }

    /// Reduce span `cycle` of the histogram into the pending map.
    ///
    /// The modal value is taken as the bin maximising a 5-tap weighted sum
    /// of neighbouring bins; the stored value is one less than that bin,
    /// which empirically leaves less residual noise in subtracted images.
    fn reduce_span(&mut self, cycle: usize) {
        let step = self.len / self.reduction_cycles + 1;
        let start = step * cycle;
        let stop = (start + step).min(self.len);

        for i in start..stop {
            let bins = &self.histogram[i * 256..(i + 1) * 256];
            let mut mode = 0usize;
            let mut mode_weight = 0u32;
            for f in 4..256 {
                let weight = 4 * bins[f - 4]
                    + 8 * bins[f - 3]
                    + 10 * bins[f - 2]
                    + 8 * bins[f - 1]
                    + 4 * bins[f];
                if weight > mode_weight {
                    mode = f;
                    mode_weight = weight;
                }
            }
            self.pending[i] = (mode as i32 - 1).clamp(0, 255) as u8;
        }
    }

    /// Rotate the completed map in at index 0 and start a fresh window.
    fn promote(&mut self) {
        let mut recycled = self.maps.pop().unwrap_or_else(|| vec![0; self.len]);
        std::mem::swap(&mut recycled, &mut self.pending);
        self.maps.insert(0, recycled);
        self.histogram.fill(0);
        self.frames_accumulated = 0;
        log::debug!("Background map refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_input_reduces_to_value_plus_one() {
        let len = 64;
        let window = 100;
        let cycles = 4;
        let mut model = BackgroundModel::new(len, window, 2, cycles);

        let frame = vec![40u8; len];
        let mut promoted = false;
        // Histogram keeps filling while the chunked reduction runs.
        for _ in 0..window + cycles + 1 {
            model.accumulate(&frame);
            promoted |= model.advance();
        }

        assert!(promoted);
        // The 5-tap window peaks two bins above the spike; minus one gives 41.
        assert!(model.map().iter().all(|&v| v == 41));
    }

    #[test]
    fn test_map_ring_keeps_most_recent_first() {
        let len = 8;
        let mut model = BackgroundModel::new(len, 10, 2, 2);

        for value in [30u8, 90u8] {
            let frame = vec![value; len];
            loop {
                model.accumulate(&frame);
                if model.advance() {
                    break;
                }
            }
        }

        assert!(model.map().iter().all(|&v| v == 91));
        assert!(model.maps[1].iter().all(|&v| v == 31));
    }

    #[test]
    fn test_no_reduction_before_window_fills() {
        let mut model = BackgroundModel::new(16, 50, 2, 4);
        let frame = vec![10u8; 16];
        for _ in 0..49 {
            model.accumulate(&frame);
            assert!(!model.advance());
        }
        assert!(model.map().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_dark_pixels_clamp_to_zero() {
        // An empty histogram never beats weight zero, so mode stays at bin 0
        // and the stored value clamps at 0 rather than underflowing.
        let mut model = BackgroundModel::new(4, 1, 1, 1);
        model.accumulate(&[0u8; 4]);
        // value 0 sits below the scanned bin range; bins 4.. see no counts
        // except through the tap window at f=4.
        model.advance();
        model.accumulate(&[0u8; 4]);
        model.advance();
        assert!(model.map().iter().all(|&v| v <= 3));
    }
}
