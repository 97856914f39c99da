//! Synthetic frame generation for tests.
//!
//! Produces planar YUV420 frame sequences without a camera: a flat sky
//! background with optional bright rectangles, single pixels and full-frame
//! flashes, plus a scripted [`FrameSource`] that replays a prepared
//! sequence at a synthetic UTC cadence.

mod frame_generator;

pub use frame_generator::FrameGenerator;

use crate::source::{FrameSource, Result};
use crate::yuv;

/// Replays a prepared list of frames as a rewindable [`FrameSource`].
pub struct ScriptedSource {
    width: usize,
    height: usize,
    fps: f64,
    start_utc: f64,
    frames: Vec<Vec<u8>>,
    cursor: usize,
}

impl ScriptedSource {
    /// Build a source over prepared YUV420 frames.
    ///
    /// # Panics
    ///
    /// Panics if any frame has the wrong byte length.
    #[must_use]
    pub fn new(
        width: usize,
        height: usize,
        fps: f64,
        start_utc: f64,
        frames: Vec<Vec<u8>>,
    ) -> Self {
        let frame_bytes = yuv::frame_bytes(width, height);
        assert!(frames.iter().all(|f| f.len() == frame_bytes));
        Self {
            width,
            height,
            fps,
            start_utc,
            frames,
            cursor: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn fetch(&mut self, buf: &mut [u8]) -> Result<Option<f64>> {
        let Some(frame) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        buf[..frame.len()].copy_from_slice(frame);
        let utc = self.start_utc + self.cursor as f64 / self.fps;
        self.cursor += 1;
        Ok(Some(utc))
    }

    fn rewind(&mut self) -> Result<Option<f64>> {
        self.cursor = 0;
        Ok(Some(self.start_utc))
    }
}
