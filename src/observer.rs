//! The observing loop.
//!
//! One single-threaded loop drives the whole pipeline: frames are pulled
//! from the source into the ring buffer, fed to the background model and
//! any active time-lapse exposure, and compared against an earlier frame by
//! the motion detector. The event tracker, clip streaming, time-lapse
//! scheduling and trigger throttling are all serviced once per frame, so
//! every frame is an atomic unit of work and errors never propagate across
//! frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::background::BackgroundModel;
use crate::config::ObserverConfig;
use crate::events::EventTracker;
use crate::mask::Mask;
use crate::noise::{estimate_noise_level, NOISE_FRAMES};
use crate::products::{Metadata, ProductWriter};
use crate::ring::FrameRing;
use crate::source::{FrameSource, SourceError};
use crate::trigger::MotionDetector;
use crate::yuv;

/// Extra run-in frames beyond one background window, letting the camera
/// settle before triggering is enabled.
const RUN_IN_EXTRA_FRAMES: usize = 100;

/// Noise level assumed before the first estimate, high enough to suppress
/// spurious triggers during warm-up.
const INITIAL_NOISE_LEVEL: f64 = 128.0;

/// Errors that abort an observing run.
#[derive(Error, Debug)]
pub enum ObserveError {
    /// The frame source failed permanently.
    #[error("frame source failure: {0}")]
    Source(#[from] SourceError),
}

/// Result type alias for observer operations.
pub type Result<T> = std::result::Result<T, ObserveError>;

/// Bounds the number of confirmed events per rolling window.
pub struct Throttle {
    period_frames: usize,
    max_events: usize,
    timer: usize,
    count: usize,
}

impl Throttle {
    /// Build a throttle from a period in minutes at the given frame rate.
    #[must_use]
    pub fn new(period_minutes: f64, fps: f64, max_events: usize) -> Self {
        let period_frames = (period_minutes * 60.0 * fps).ceil() as usize;
        Self {
            period_frames: period_frames.max(1),
            max_events,
            timer: 0,
            count: 0,
        }
    }

    /// Advance the rolling window by one frame.
    pub fn tick(&mut self) {
        self.timer += 1;
        if self.timer >= self.period_frames {
            self.timer = 0;
            self.count = 0;
        }
    }

    /// Record confirmed event closures.
    pub fn record(&mut self, closures: usize) {
        self.count += closures;
    }

    /// Whether new events may currently be confirmed.
    #[must_use]
    pub fn allows(&self) -> bool {
        self.count < self.max_events
    }
}

/// Integer-sum accumulator for one time-lapse exposure.
struct TimelapseStacker {
    stack: Vec<i32>,
    /// Frames accumulated; -1 while no exposure is active.
    frames: i64,
    /// Scheduled UTC start of the next exposure.
    next_start_utc: f64,
    frames_per_exposure: usize,
}

/// Top-level scheduler driving all pipeline components per frame.
pub struct Observer {
    config: ObserverConfig,
    width: usize,
    height: usize,
    channels: usize,
    frame_size: usize,
    fps: f64,
    mask: Mask,
    products: ProductWriter,
    ring: FrameRing,
    background: BackgroundModel,
    detector: MotionDetector,
    tracker: EventTracker,
    throttle: Throttle,
    timelapse: TimelapseStacker,
    /// Channel planes of the frame just read.
    channels_new: Vec<u8>,
    /// Scratch planes for the comparison frame, filled on demand.
    channels_old: Vec<u8>,
    noise_level: f64,
    /// Brightness sample from the most recent time-lapse output.
    mean_level: f64,
    utc: f64,
    frame_counter: usize,
    run_in_countdown: usize,
    stop: Arc<AtomicBool>,
}

impl Observer {
    /// Build an observer for the given frame geometry.
    ///
    /// # Panics
    ///
    /// Panics if the mask geometry does not match `width` x `height`.
    #[must_use]
    pub fn new(
        config: ObserverConfig,
        width: usize,
        height: usize,
        fps: f64,
        mask: Mask,
        products: ProductWriter,
    ) -> Self {
        assert_eq!(mask.width(), width);
        assert_eq!(mask.height(), height);

        let channels = config.channel_count();
        let frame_size = width * height;
        let ring_frames = ((fps * config.video_buffer_len) as usize).max(1);
        let prefix_frames = (config.trigger_prefix_time * fps) as usize;
        let suffix_frames = (config.trigger_suffix_time * fps) as usize;
        let max_duration_frames = (config.trigger_max_duration * fps) as usize;
        let frames_per_exposure = ((config.timelapse_exposure * fps) as usize).max(1);

        let tracker = EventTracker::new(
            width,
            height,
            channels,
            fps,
            prefix_frames,
            suffix_frames,
            max_duration_frames,
            config.trigger_framegroup,
            products.clone(),
        );
        let throttle = Throttle::new(
            config.trigger_throttle_period,
            fps,
            config.trigger_throttle_maxevt,
        );
        let background = BackgroundModel::new(
            frame_size * channels,
            config.background_map_frames,
            config.background_map_samples,
            config.background_map_reduction_cycles,
        );
        let run_in_countdown = RUN_IN_EXTRA_FRAMES + config.background_map_frames;

        Self {
            width,
            height,
            channels,
            frame_size,
            fps,
            mask,
            products,
            ring: FrameRing::new(ring_frames, yuv::frame_bytes(width, height)),
            background,
            detector: MotionDetector::new(width, height),
            tracker,
            throttle,
            timelapse: TimelapseStacker {
                stack: vec![0; frame_size * channels],
                frames: -1,
                next_start_utc: f64::INFINITY,
                frames_per_exposure,
            },
            channels_new: vec![0; frame_size * channels],
            channels_old: vec![0; frame_size * channels],
            noise_level: INITIAL_NOISE_LEVEL,
            mean_level: 0.0,
            utc: 0.0,
            frame_counter: 0,
            run_in_countdown,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that stops the loop at the next frame boundary.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Frames processed so far.
    #[must_use]
    pub fn frame_counter(&self) -> usize {
        self.frame_counter
    }

    /// Most recent noise estimate.
    #[must_use]
    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    /// Run the observing loop until end of stream or a stop request.
    ///
    /// On end of stream, open events are closed and their clips finalised;
    /// on a stop request, in-flight clips and pending time-lapses are
    /// discarded and file handles released.
    ///
    /// # Errors
    ///
    /// Returns `ObserveError::Source` if the frame source fails
    /// permanently.
    pub fn run(&mut self, source: &mut dyn FrameSource) -> Result<()> {
        log::info!(
            "Observing run started: {}x{} at {} fps, {} channel(s)",
            self.width,
            self.height,
            self.fps,
            self.channels
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("Stop requested; ending observing run.");
                return Ok(());
            }

            // Run-in: wait for the first background map before triggering;
            // on completion rewind file sources and schedule time-lapses.
            if self.run_in_countdown > 0 {
                self.run_in_countdown -= 1;
                if self.run_in_countdown == 0 {
                    log::info!("Run-in period completed.");
                    if let Some(utc) = source.rewind()? {
                        self.utc = utc;
                    }
                    let interval = self.config.timelapse_interval;
                    self.timelapse.next_start_utc =
                        (self.utc / interval).ceil() * interval + 0.5;
                }
            }

            let slot = self.ring.slot(self.frame_counter);

            // Once per trip around the ring, refresh the noise estimate.
            if slot == 0 {
                self.noise_level = estimate_noise_level(&self.ring, self.frame_size, NOISE_FRAMES);
            }

            match source.fetch(self.ring.frame_mut(slot))? {
                Some(utc) => self.utc = utc,
                None => {
                    log::info!("End of stream after {} frames.", self.frame_counter);
                    self.tracker.finalize(
                        self.frame_counter,
                        self.utc,
                        &self.ring,
                        self.noise_level,
                        self.mean_level,
                    );
                    return Ok(());
                }
            }

            yuv::frame_to_channels(
                self.ring.frame(slot),
                self.width,
                self.height,
                self.channels,
                &mut self.channels_new,
            );
            self.background.accumulate(&self.channels_new);
            if self.timelapse.frames >= 0 {
                for (dst, &src) in self.timelapse.stack.iter_mut().zip(&self.channels_new) {
                    *dst += src as i32;
                }
            }
            self.background.advance();

            // Time-lapse scheduling.
            if self.timelapse.frames >= 0 {
                self.timelapse.frames += 1;
            } else if self.utc > self.timelapse.next_start_utc {
                self.timelapse.stack.fill(0);
                self.timelapse.frames = 0;
            }
            if self.timelapse.frames >= 0
                && (self.timelapse.frames >= self.timelapse.frames_per_exposure as i64
                    || self.utc > self.timelapse.next_start_utc + self.config.timelapse_interval - 1.0)
            {
                self.emit_timelapse();
                self.timelapse.next_start_utc += self.config.timelapse_interval;
                self.timelapse.frames = -1;
            }

            self.throttle.tick();
            let triggering_allowed = self.run_in_countdown == 0 && self.throttle.allows();

            // Close ended events and keep clips draining.
            let closures = self.tracker.close_ended(
                self.frame_counter,
                self.utc,
                &self.channels_new,
                self.noise_level,
                self.mean_level,
            );
            self.throttle.record(closures);
            self.tracker.flush_clips(&self.ring, self.frame_counter);

            if triggering_allowed {
                let lag = self.config.stack_comparison_interval;
                let old_slot = self.ring.lagged_slot(self.frame_counter, lag);
                let image_new = &self.ring.frame(slot)[..self.frame_size];
                let image_old = &self.ring.frame(old_slot)[..self.frame_size];
                let candidates =
                    self.detector
                        .scan(image_new, image_old, &self.mask, self.noise_level);

                if !candidates.is_empty() {
                    yuv::frame_to_channels(
                        self.ring.frame(old_slot),
                        self.width,
                        self.height,
                        self.channels,
                        &mut self.channels_old,
                    );
                    for candidate in &candidates {
                        self.tracker.register(
                            candidate,
                            &mut self.detector,
                            self.frame_counter,
                            self.utc,
                            &self.channels_new,
                            &self.channels_old,
                            self.noise_level,
                            self.mean_level,
                        );
                    }
                }
            }

            self.frame_counter += 1;
        }
    }

    /// Write the products of a completed time-lapse exposure.
    fn emit_timelapse(&mut self) {
        let frame_count = self.timelapse.frames.max(1) as i32;
        let utc = self.timelapse.next_start_utc;
        let stub = match self.products.filename_stub(utc, "timelapse", "frame_") {
            Ok(stub) => stub,
            Err(e) => {
                log::warn!("Cannot create timelapse products directory: {e}");
                return;
            }
        };
        let noise = self.noise_level;
        let stack_noise = noise / (frame_count as f64).sqrt();

        // Straight stack.
        let path = PathBuf::from(format!("{}BS0.rgb", stub.display()));
        match self.products.write_stacked_frame(
            &path,
            self.width,
            self.height,
            self.channels,
            &self.timelapse.stack,
            frame_count,
            self.config.stack_target_brightness,
        ) {
            Ok(gain) => {
                self.mean_level = gain.mean_level;
                let meta = Metadata::new()
                    .str("obstoryId", self.products.obstory_id())
                    .float("utc", utc)
                    .str("semanticType", "pigazing:timelapse")
                    .int("width", self.width as i64)
                    .int("height", self.height as i64)
                    .float("inputNoiseLevel", noise)
                    .float("stackNoiseLevel", stack_noise * gain.gain as f64)
                    .float("meanLevel", gain.mean_level)
                    .float("gainFactor", gain.gain as f64)
                    .int("stackedFrames", frame_count as i64);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        // Background-subtracted version.
        let path = PathBuf::from(format!("{}BS1.rgb", stub.display()));
        match self.products.write_subtracted_frame(
            &path,
            self.width,
            self.height,
            self.channels,
            &self.timelapse.stack,
            frame_count,
            self.config.stack_target_brightness,
            self.background.map(),
        ) {
            Ok(gain) => {
                let meta = Metadata::new()
                    .str("obstoryId", self.products.obstory_id())
                    .float("utc", utc)
                    .str("semanticType", "pigazing:timelapse/backgroundSubtracted")
                    .int("width", self.width as i64)
                    .int("height", self.height as i64)
                    .float("inputNoiseLevel", noise)
                    .float("stackNoiseLevel", stack_noise * gain.gain as f64)
                    .float("gainFactor", gain.gain as f64)
                    .int("stackedFrames", frame_count as i64);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        // The background map itself, for diagnostics.
        let path = PathBuf::from(format!("{}skyBackground.rgb", stub.display()));
        match self.products.write_frame(
            &path,
            self.width,
            self.height,
            self.channels,
            self.background.map(),
        ) {
            Ok(()) => {
                let window = self.background.window_frames();
                let meta = Metadata::new()
                    .str("obstoryId", self.products.obstory_id())
                    .float("utc", utc)
                    .str("semanticType", "pigazing:timelapse/backgroundModel")
                    .int("width", self.width as i64)
                    .int("height", self.height as i64)
                    .float("inputNoiseLevel", noise)
                    .float("stackNoiseLevel", noise / (window as f64).sqrt())
                    .float("meanLevel", self.mean_level)
                    .int("stackedFrames", window as i64);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        log::info!(
            "Time-lapse exposure written: {} frames ending at frame {}",
            frame_count,
            self.frame_counter
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_resets_after_period() {
        // 0.1 minutes at 10 fps: a 60-frame window.
        let mut throttle = Throttle::new(0.1, 10.0, 2);
        assert!(throttle.allows());

        throttle.record(2);
        assert!(!throttle.allows());

        for _ in 0..59 {
            throttle.tick();
            assert!(!throttle.allows());
        }
        throttle.tick();
        assert!(throttle.allows());
    }

    #[test]
    fn test_throttle_period_rounds_up() {
        // 0.01 min * 60 * 7 fps = 4.2 frames: the window must be 5 frames.
        let throttle = Throttle::new(0.01, 7.0, 1);
        assert_eq!(throttle.period_frames, 5);
    }

    #[test]
    fn test_observer_survives_empty_source() {
        use crate::test_utils::ScriptedSource;

        let dir = tempfile::tempdir().unwrap();
        let config = ObserverConfig {
            background_map_frames: 4,
            background_map_reduction_cycles: 2,
            video_buffer_len: 1.0,
            ..ObserverConfig::default()
        };
        let mask = Mask::allow_all(48, 48);
        let products = ProductWriter::new(dir.path(), "obs0", "nonlive");
        let mut observer = Observer::new(config, 48, 48, 10.0, mask, products);

        let mut source = ScriptedSource::new(48, 48, 10.0, 1000.0, Vec::new());
        observer.run(&mut source).unwrap();
        assert_eq!(observer.frame_counter(), 0);
    }

    #[test]
    fn test_stop_flag_ends_run() {
        use crate::test_utils::{FrameGenerator, ScriptedSource};

        let dir = tempfile::tempdir().unwrap();
        let config = ObserverConfig {
            background_map_frames: 1000,
            video_buffer_len: 1.0,
            ..ObserverConfig::default()
        };
        let mask = Mask::allow_all(48, 48);
        let products = ProductWriter::new(dir.path(), "obs0", "nonlive");
        let mut observer = Observer::new(config, 48, 48, 10.0, mask, products);
        observer.stop_flag().store(true, Ordering::SeqCst);

        let generator = FrameGenerator::new(48, 48, 40);
        let frames = vec![generator.uniform(); 10];
        let mut source = ScriptedSource::new(48, 48, 10.0, 1000.0, frames);
        observer.run(&mut source).unwrap();
        assert_eq!(observer.frame_counter(), 0);
    }
}
