//! Ring video buffer.
//!
//! The last few seconds of raw YUV420 video are kept in a fixed circular
//! buffer so that a confirmed event can be written out with pre-roll from
//! before its first detection. Slots are addressed by the monotonic frame
//! counter modulo the capacity; after the buffer has wrapped once, the frame
//! at offset `-k` was captured `k` frame intervals ago.

/// Fixed-capacity circular store of raw YUV420 frames.
///
/// Storage is one flat allocation of `capacity * frame_bytes`; nothing is
/// allocated after construction.
pub struct FrameRing {
    capacity: usize,
    frame_bytes: usize,
    data: Vec<u8>,
}

impl FrameRing {
    /// Allocate a ring of `capacity` frames of `frame_bytes` each.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    #[must_use]
    pub fn new(capacity: usize, frame_bytes: usize) -> Self {
        assert!(capacity > 0 && frame_bytes > 0);
        Self {
            capacity,
            frame_bytes,
            data: vec![0; capacity * frame_bytes],
        }
    }

    /// Number of frame slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per frame slot.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// The slot the given frame counter maps to.
    #[inline]
    #[must_use]
    pub fn slot(&self, frame_counter: usize) -> usize {
        frame_counter % self.capacity
    }

    /// The slot `lag` frames before the given frame counter.
    #[inline]
    #[must_use]
    pub fn lagged_slot(&self, frame_counter: usize, lag: usize) -> usize {
        (frame_counter + self.capacity - lag % self.capacity) % self.capacity
    }

    /// Frames between `from` and `to` walking forward around the ring,
    /// inclusive of both endpoints.
    #[inline]
    #[must_use]
    pub fn span(&self, from: usize, to: usize) -> usize {
        (to + self.capacity - from) % self.capacity + 1
    }

    /// Borrow the frame stored in `slot`.
    #[must_use]
    pub fn frame(&self, slot: usize) -> &[u8] {
        let start = slot * self.frame_bytes;
        &self.data[start..start + self.frame_bytes]
    }

    /// Mutably borrow the frame stored in `slot`, for the intake path.
    pub fn frame_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * self.frame_bytes;
        &mut self.data[start..start + self.frame_bytes]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_wraps() {
        let ring = FrameRing::new(8, 4);
        assert_eq!(ring.slot(0), 0);
        assert_eq!(ring.slot(7), 7);
        assert_eq!(ring.slot(8), 0);
        assert_eq!(ring.slot(19), 3);
    }

    #[test]
    fn test_lagged_slot() {
        let ring = FrameRing::new(8, 4);
        assert_eq!(ring.lagged_slot(5, 2), 3);
        assert_eq!(ring.lagged_slot(1, 2), 7);
        assert_eq!(ring.lagged_slot(0, 8), 0);
    }

    #[test]
    fn test_span() {
        let ring = FrameRing::new(8, 4);
        assert_eq!(ring.span(3, 3), 1);
        assert_eq!(ring.span(3, 5), 3);
        assert_eq!(ring.span(6, 1), 4);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut ring = FrameRing::new(3, 4);
        for counter in 0..5usize {
            let slot = ring.slot(counter);
            ring.frame_mut(slot).fill(counter as u8);
        }
        // Counters 2, 3, 4 survive; 0 and 1 were overwritten.
        assert_eq!(ring.frame(ring.slot(4)), &[4u8; 4]);
        assert_eq!(ring.frame(ring.slot(3)), &[3u8; 4]);
        assert_eq!(ring.frame(ring.slot(2)), &[2u8; 4]);
    }
}
