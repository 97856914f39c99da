//! Moving-object event tracking.
//!
//! Candidate detections from the motion detector are associated into
//! tracks. A track must be seen at least twice and move a minimum distance
//! before it is confirmed (which rejects twinkling stars); confirmation
//! opens a video clip with pre-roll from the ring buffer. While an event is
//! tracked, per-pixel sum and maximum composites accumulate. When it
//! disappears or outstays the maximum duration the composites and a
//! metadata sidecar describing the full detection path are written, and the
//! event lingers in a video-only state until its clip has drained from the
//! ring buffer.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::clip::ClipWriter;
use crate::products::{Metadata, ProductWriter};
use crate::ring::FrameRing;
use crate::trigger::{Candidate, MotionDetector};

/// Simultaneous events tracked.
pub const MAX_EVENTS: usize = 3;

/// Maximum detections recorded for a single event.
pub const MAX_DETECTIONS: usize = 1024;

/// Maximum movement of an object between detections, in pixels.
const TRACK_MAX_STEP: f64 = 70.0;

/// Detections required before an event can be confirmed.
const MIN_DETECTIONS_FOR_EVENT: usize = 2;

/// Minimum path length in pixels between first and last detection.
const MIN_PATH_LENGTH: f64 = 4.0;

/// One sighting of a moving object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Frame counter at the time of the sighting.
    pub frame_counter: usize,
    /// Mean column of the triggering block.
    pub x: i32,
    /// Mean row of the triggering block.
    pub y: i32,
    /// Pixels in the triggering block.
    pub pixel_count: i32,
    /// Total brightness excess of the triggering block.
    pub amplitude: i32,
    /// Capture time of the frame, UTC seconds.
    pub utc: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    /// Slot is free.
    Idle,
    /// Detections are being associated and composites accumulated.
    Tracking,
    /// The event has ended; only its clip is still draining.
    VideoOnly,
}

struct ClipOutput {
    writer: Option<ClipWriter>,
    filename: PathBuf,
    /// Absolute frame counter of the next frame to stream.
    write_cursor: usize,
    /// Absolute frame counter of the last frame to include.
    end_cursor: Option<usize>,
}

struct Event {
    state: EventState,
    confirmed: bool,
    detections: Vec<Detection>,
    start_time: f64,
    filename_stub: PathBuf,
    /// Per-pixel sum over the event lifetime.
    stacked_image: Vec<i32>,
    /// Per-pixel maximum over the event lifetime.
    max_stack: Vec<i32>,
    /// Per-pixel record of every trigger observed during the event.
    max_trigger: Vec<u8>,
    clip: ClipOutput,
}

impl Event {
    fn new(frame_size: usize, channels: usize) -> Self {
        Self {
            state: EventState::Idle,
            confirmed: false,
            detections: Vec::with_capacity(MAX_DETECTIONS),
            start_time: 0.0,
            filename_stub: PathBuf::new(),
            stacked_image: vec![0; frame_size * channels],
            max_stack: vec![0; frame_size * channels],
            max_trigger: vec![0; frame_size],
            clip: ClipOutput {
                writer: None,
                filename: PathBuf::new(),
                write_cursor: 0,
                end_cursor: None,
            },
        }
    }

    fn reset(&mut self) {
        self.state = EventState::Idle;
        self.confirmed = false;
        self.detections.clear();
        self.clip.writer = None;
        self.clip.end_cursor = None;
    }
}

/// Associates detections into tracks and drives their lifecycle.
pub struct EventTracker {
    width: usize,
    height: usize,
    channels: usize,
    frame_size: usize,
    fps: f64,
    prefix_frames: usize,
    suffix_frames: usize,
    max_duration_frames: usize,
    framegroup: usize,
    products: ProductWriter,
    events: Vec<Event>,
}

impl EventTracker {
    /// Allocate tracker state.
    ///
    /// All frame-count arguments are in frames, already scaled by the frame
    /// rate.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        fps: f64,
        prefix_frames: usize,
        suffix_frames: usize,
        max_duration_frames: usize,
        framegroup: usize,
        products: ProductWriter,
    ) -> Self {
        let frame_size = width * height;
        Self {
            width,
            height,
            channels,
            frame_size,
            fps,
            prefix_frames,
            suffix_frames,
            max_duration_frames,
            framegroup: framegroup.max(1),
            products,
            events: (0..MAX_EVENTS)
                .map(|_| Event::new(frame_size, channels))
                .collect(),
        }
    }

    /// Number of events currently tracking or draining video.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.state != EventState::Idle)
            .count()
    }

    /// Feed one candidate detection into the tracker.
    ///
    /// The candidate either extends the nearest active track, or opens a
    /// new event with its forensic stills. `channels_new` / `channels_old`
    /// are the channel planes of the compared frame pair.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        candidate: &Candidate,
        detector: &mut MotionDetector,
        frame_counter: usize,
        utc: f64,
        channels_new: &[u8],
        channels_old: &[u8],
        noise_level: f64,
        mean_level: f64,
    ) {
        // Mark the firing block in the diagnostic trigger plane and fold it
        // into the all-triggers composite of every tracking event.
        detector.highlight_block(candidate.block_id);
        let trigger_map = detector.trigger_map();
        let trigger_plane = detector.trigger_plane();
        for o in 0..self.frame_size {
            let id = trigger_map[o];
            if id != 0 && detector.block_root(id) == candidate.block_id {
                for event in &mut self.events {
                    if event.state == EventState::Tracking {
                        event.max_trigger[o] = trigger_plane[o];
                    }
                }
            }
        }

        // Find the nearest active track.
        let mut closest: Option<usize> = None;
        let mut closest_dist = f64::MAX;
        for (i, event) in self.events.iter().enumerate() {
            if event.state != EventState::Tracking {
                continue;
            }
            let last = event.detections.last().expect("tracking event has detections");
            let dist =
                ((candidate.x - last.x) as f64).hypot((candidate.y - last.y) as f64);
            if dist < closest_dist {
                closest_dist = dist;
                closest = Some(i);
            }
        }

        if let Some(i) = closest {
            if closest_dist < TRACK_MAX_STEP {
                self.associate(i, candidate, frame_counter, utc);
                return;
            }
        }

        self.create_event(
            candidate,
            detector,
            frame_counter,
            utc,
            channels_new,
            channels_old,
            noise_level,
            mean_level,
        );
    }

    /// Extend an existing track with a candidate.
    fn associate(&mut self, index: usize, candidate: &Candidate, frame_counter: usize, utc: f64) {
        let event = &mut self.events[index];
        let last = event.detections.last_mut().expect("tracking event has detections");

        if last.frame_counter == frame_counter {
            // A second block for the same object in the same frame: merge
            // into an intensity-weighted centroid.
            let total = last.amplitude + candidate.amplitude;
            if total > 0 {
                last.x = (last.x * last.amplitude + candidate.x * candidate.amplitude) / total;
                last.y = (last.y * last.amplitude + candidate.y * candidate.amplitude) / total;
            }
            last.amplitude += candidate.amplitude;
            last.pixel_count += candidate.pixel_count;
            return;
        }

        if event.detections.len() < MAX_DETECTIONS {
            event.detections.push(Detection {
                frame_counter,
                x: candidate.x,
                y: candidate.y,
                pixel_count: candidate.pixel_count,
                amplitude: candidate.amplitude,
                utc,
            });
        }

        if !event.confirmed {
            let first = event.detections[0];
            let newest = *event.detections.last().expect("just pushed");
            let path_length =
                ((first.x - newest.x) as f64).hypot((first.y - newest.y) as f64);
            if event.detections.len() >= MIN_DETECTIONS_FOR_EVENT && path_length >= MIN_PATH_LENGTH
            {
                log::info!("Detection confirmed.");
                match ClipWriter::create(&event.clip.filename, self.width, self.height) {
                    Ok(writer) => {
                        event.confirmed = true;
                        event.clip.writer = Some(writer);
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to open clip {}: {e}",
                            event.clip.filename.display()
                        );
                    }
                }
            }
        }
    }

    /// Open a new event for a candidate no existing track accepts.
    #[allow(clippy::too_many_arguments)]
    fn create_event(
        &mut self,
        candidate: &Candidate,
        detector: &MotionDetector,
        frame_counter: usize,
        utc: f64,
        channels_new: &[u8],
        channels_old: &[u8],
        noise_level: f64,
        mean_level: f64,
    ) {
        let Some(index) = self
            .events
            .iter()
            .position(|e| e.state == EventState::Idle)
        else {
            log::info!("Ignoring trigger; no free event slots.");
            return;
        };

        let stub = match self.products.filename_stub(utc, "triggers", "event") {
            Ok(stub) => stub,
            Err(e) => {
                log::warn!("Cannot create trigger products directory: {e}");
                return;
            }
        };

        log::info!(
            "Camera triggered at x={}, y={} (frame {frame_counter})",
            candidate.x,
            candidate.y
        );

        let event = &mut self.events[index];
        event.state = EventState::Tracking;
        event.confirmed = false;
        event.detections.clear();
        event.detections.push(Detection {
            frame_counter,
            x: candidate.x,
            y: candidate.y,
            pixel_count: candidate.pixel_count,
            amplitude: candidate.amplitude,
            utc,
        });
        event.start_time = utc;
        event.clip.filename = suffixed(&stub, ".vid");
        event.clip.writer = None;
        event.clip.write_cursor = frame_counter.saturating_sub(self.prefix_frames);
        event.clip.end_cursor = None;
        event.filename_stub = stub;

        // Prime the composites from the triggering frame.
        for (dst, &src) in event.stacked_image.iter_mut().zip(channels_new) {
            *dst = src as i32;
        }
        for (dst, &src) in event.max_stack.iter_mut().zip(channels_new) {
            *dst = src as i32;
        }
        event.max_trigger.copy_from_slice(detector.trigger_plane());

        let stub = self.events[index].filename_stub.clone();
        let start_time = self.events[index].start_time;
        self.write_opening_stills(
            &stub,
            start_time,
            detector,
            channels_new,
            channels_old,
            noise_level,
            mean_level,
        );
    }

    /// Accumulate composites and close tracks that have ended.
    ///
    /// Called once per observer iteration with the channel planes of the
    /// frame just read. Returns the number of confirmed events closed, for
    /// the throttle.
    pub fn close_ended(
        &mut self,
        frame_counter: usize,
        utc: f64,
        channels_current: &[u8],
        noise_level: f64,
        mean_level: f64,
    ) -> usize {
        let mut closures = 0;
        for index in 0..self.events.len() {
            if self.events[index].state != EventState::Tracking {
                continue;
            }
            {
                let event = &mut self.events[index];
                for (dst, &src) in event.stacked_image.iter_mut().zip(channels_current) {
                    *dst += src as i32;
                }
                for (dst, &src) in event.max_stack.iter_mut().zip(channels_current) {
                    *dst = (*dst).max(src as i32);
                }
            }

            let first = self.events[index].detections[0];
            let last = *self.events[index]
                .detections
                .last()
                .expect("tracking event has detections");
            let too_long = frame_counter > first.frame_counter + self.max_duration_frames;
            let disappeared = frame_counter > last.frame_counter + self.suffix_frames;
            if !too_long && !disappeared {
                continue;
            }

            if !self.events[index].confirmed {
                log::info!("Detection not confirmed.");
                self.events[index].reset();
                continue;
            }

            closures += 1;
            self.events[index].state = EventState::VideoOnly;
            let end = (last.frame_counter + self.suffix_frames)
                .min(frame_counter.saturating_sub(1));
            self.events[index].clip.end_cursor = Some(end);
            self.write_closing_products(index, frame_counter, utc, noise_level, mean_level);
        }
        closures
    }

    /// Stream pending clip frames from the ring buffer.
    ///
    /// At most `TRIGGER_FRAMEGROUP` frames are flushed per clip per call,
    /// and streaming never overtakes the frame most recently written to the
    /// ring. A clip whose end cursor has been passed is finalised and its
    /// event slot freed.
    pub fn flush_clips(&mut self, ring: &FrameRing, frame_counter: usize) {
        for event in &mut self.events {
            if event.clip.writer.is_none() {
                if event.state == EventState::VideoOnly {
                    event.reset();
                }
                continue;
            }

            let mut streamed = 0;
            while streamed < self.framegroup {
                if event.clip.write_cursor > frame_counter {
                    break;
                }
                if let Some(end) = event.clip.end_cursor {
                    if event.clip.write_cursor > end {
                        break;
                    }
                }
                let slot = ring.slot(event.clip.write_cursor);
                let writer = event.clip.writer.as_mut().expect("checked above");
                if let Err(e) = writer.write_frame(ring.frame(slot)) {
                    log::warn!("Clip write failed: {e}");
                    event.clip.end_cursor = Some(event.clip.write_cursor.saturating_sub(1));
                    break;
                }
                event.clip.write_cursor += 1;
                streamed += 1;
            }

            if let Some(end) = event.clip.end_cursor {
                if event.clip.write_cursor > end {
                    if let Some(writer) = event.clip.writer.take() {
                        if let Err(e) = writer.finish() {
                            log::warn!("Failed to finalise clip: {e}");
                        }
                    }
                    if event.state == EventState::VideoOnly {
                        event.reset();
                    }
                }
            }
        }
    }

    /// Close out every event at end of stream.
    ///
    /// Confirmed events still tracking get their closing products; their
    /// clips (and any already-draining clips) are flushed to their end
    /// cursors and finalised. Unconfirmed events are dropped.
    pub fn finalize(
        &mut self,
        frame_counter: usize,
        utc: f64,
        ring: &FrameRing,
        noise_level: f64,
        mean_level: f64,
    ) {
        let last_valid = frame_counter.saturating_sub(1);
        for index in 0..self.events.len() {
            if self.events[index].state != EventState::Tracking {
                continue;
            }
            if !self.events[index].confirmed {
                self.events[index].reset();
                continue;
            }
            let last = *self.events[index]
                .detections
                .last()
                .expect("tracking event has detections");
            self.events[index].state = EventState::VideoOnly;
            let end = (last.frame_counter + self.suffix_frames).min(last_valid);
            self.events[index].clip.end_cursor = Some(end);
            self.write_closing_products(index, frame_counter, utc, noise_level, mean_level);
        }

        while self.events.iter().any(|e| e.clip.writer.is_some()) {
            self.flush_clips(ring, last_valid);
        }
        for event in &mut self.events {
            if event.state == EventState::VideoOnly {
                event.reset();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_opening_stills(
        &self,
        stub: &Path,
        start_time: f64,
        detector: &MotionDetector,
        channels_new: &[u8],
        channels_old: &[u8],
        noise_level: f64,
        mean_level: f64,
    ) {
        let stills: [(&str, &str, &[u8], usize); 5] = [
            (
                "_mapDifference.rgb",
                "pigazing:movingObject/mapDifference",
                detector.difference_plane(),
                1,
            ),
            (
                "_mapExcludedPixels.rgb",
                "pigazing:movingObject/mapExcludedPixels",
                detector.excluded_plane(),
                1,
            ),
            (
                "_mapTrigger.rgb",
                "pigazing:movingObject/mapTrigger",
                detector.trigger_plane(),
                1,
            ),
            (
                "_triggerFrame.rgb",
                "pigazing:movingObject/triggerFrame",
                channels_new,
                self.channels,
            ),
            (
                "_previousFrame.rgb",
                "pigazing:movingObject/previousFrame",
                channels_old,
                self.channels,
            ),
        ];

        for (suffix, semantic, pixels, channels) in stills {
            let path = suffixed(stub, suffix);
            if let Err(e) = self
                .products
                .write_frame(&path, self.width, self.height, channels, pixels)
            {
                log::warn!("Failed to write {}: {e}", path.display());
                continue;
            }
            let meta = Metadata::new()
                .str("obstoryId", self.products.obstory_id())
                .float("utc", start_time)
                .str("semanticType", semantic)
                .int("width", self.width as i64)
                .int("height", self.height as i64)
                .float("inputNoiseLevel", noise_level)
                .float("stackNoiseLevel", noise_level)
                .float("meanLevel", mean_level)
                .int("stackedFrames", 1);
            if let Err(e) = meta.write_beside(&path) {
                log::warn!("Failed to write sidecar for {}: {e}", path.display());
            }
        }
    }

    fn write_closing_products(
        &mut self,
        index: usize,
        frame_counter: usize,
        utc: f64,
        noise_level: f64,
        mean_level: f64,
    ) {
        let event = &self.events[index];
        let first = event.detections[0];
        let mid = event.detections[event.detections.len() / 2];
        let last = *event.detections.last().expect("event has detections");

        let duration = last.utc - first.utc;
        let duration_frames = last.frame_counter - first.frame_counter;
        let coadded = (frame_counter - first.frame_counter).max(1) as i32;
        let detection_count = event.detections.len() as i64;
        let amplitude_peak = event
            .detections
            .iter()
            .map(|d| d.amplitude)
            .max()
            .unwrap_or(0);
        let amplitude_sum: i64 = event.detections.iter().map(|d| d.amplitude as i64).sum();

        let composite_meta = |semantic: &str, stack_noise: f64| {
            Metadata::new()
                .str("obstoryId", self.products.obstory_id())
                .float("utc", event.start_time)
                .str("semanticType", semantic)
                .int("width", self.width as i64)
                .int("height", self.height as i64)
                .float("inputNoiseLevel", noise_level)
                .float("stackNoiseLevel", stack_noise)
                .float("meanLevel", mean_level)
                .int("stackedFrames", coadded as i64)
                .float("duration", duration)
                .int("detectionCount", detection_count)
                .int("amplitudeTimeIntegrated", amplitude_sum)
                .int("amplitudePeak", amplitude_peak as i64)
        };

        let stack_noise = noise_level / (coadded as f64).sqrt();

        let path = suffixed(&event.filename_stub, "_timeAverage.rgb");
        match self.products.write_stacked_frame(
            &path,
            self.width,
            self.height,
            self.channels,
            &event.stacked_image,
            coadded,
            0,
        ) {
            Ok(_) => {
                let meta = composite_meta("pigazing:movingObject/timeAverage", stack_noise);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        let path = suffixed(&event.filename_stub, "_maxBrightness.rgb");
        match self.products.write_stacked_frame(
            &path,
            self.width,
            self.height,
            self.channels,
            &event.max_stack,
            1,
            0,
        ) {
            Ok(_) => {
                let meta =
                    composite_meta("pigazing:movingObject/maximumBrightness", stack_noise);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        let path = suffixed(&event.filename_stub, "_allTriggers.rgb");
        match self
            .products
            .write_frame(&path, self.width, self.height, 1, &event.max_trigger)
        {
            Ok(()) => {
                let meta = composite_meta("pigazing:movingObject/allTriggers", 1.0);
                if let Err(e) = meta.write_beside(&path) {
                    log::warn!("Failed to write sidecar for {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Failed to write {}: {e}", path.display()),
        }

        // Full detection path plus a three-point bezier summary.
        let path_json = serde_json::Value::Array(
            event
                .detections
                .iter()
                .map(|d| json!([d.x, d.y, d.amplitude, round3(d.utc)]))
                .collect(),
        )
        .to_string();
        let path_bezier = json!([
            [first.x, first.y, round3(first.utc)],
            [mid.x, mid.y, round3(mid.utc)],
            [last.x, last.y, round3(last.utc)],
        ])
        .to_string();

        let prefix_time = self.prefix_frames as f64 / self.fps;
        let video_start = event.start_time - prefix_time;
        let video_fps = if duration > 0.0 {
            duration_frames as f64 / duration
        } else {
            self.fps
        };
        let significance = if noise_level > 0.0 {
            amplitude_peak as f64 / noise_level
        } else {
            amplitude_peak as f64
        };

        let meta = Metadata::new()
            .str("obstoryId", self.products.obstory_id())
            .float("utc", event.start_time)
            .str("semanticType", "pigazing:movingObject/video")
            .int("width", self.width as i64)
            .int("height", self.height as i64)
            .float("inputNoiseLevel", noise_level)
            .float("meanLevel", mean_level)
            .str("path", path_json)
            .float("duration", duration)
            .int("detectionCount", detection_count)
            .float("detectionSignificance", significance)
            .int("amplitudeTimeIntegrated", amplitude_sum)
            .int("amplitudePeak", amplitude_peak as i64)
            .str("pathBezier", path_bezier)
            .float("videoStart", video_start)
            .float("videoFPS", video_fps)
            .float("videoDuration", utc - video_start);
        if let Err(e) = meta.write_beside(&event.clip.filename) {
            log::warn!(
                "Failed to write sidecar for {}: {e}",
                event.clip.filename.display()
            );
        }
    }
}

fn suffixed(stub: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", stub.display()))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask;

    const WIDTH: usize = 160;
    const HEIGHT: usize = 120;

    fn tracker(dir: &Path) -> EventTracker {
        let products = ProductWriter::new(dir, "obs0", "nonlive");
        EventTracker::new(WIDTH, HEIGHT, 1, 25.0, 5, 5, 100, 10, products)
    }

    fn scan_rect(
        detector: &mut MotionDetector,
        x: usize,
        level: u8,
    ) -> (Vec<Candidate>, Vec<u8>, Vec<u8>) {
        let mask = Mask::allow_all(WIDTH, HEIGHT);
        let old = vec![40u8; WIDTH * HEIGHT];
        let mut new = old.clone();
        for row in 50..55 {
            for col in x..x + 10 {
                new[row * WIDTH + col] = level;
            }
        }
        let candidates = detector.scan(&new, &old, &mask, 2.0);
        (candidates, new, old)
    }

    #[test]
    fn test_new_event_emits_opening_stills() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker(dir.path());
        let mut detector = MotionDetector::new(WIDTH, HEIGHT);

        let (candidates, new, old) = scan_rect(&mut detector, 50, 200);
        assert_eq!(candidates.len(), 1);
        tracker.register(&candidates[0], &mut detector, 10, 1000.0, &new, &old, 2.0, 40.0);

        assert_eq!(tracker.active_count(), 1);
        let trigger_dir = dir.path().join("analysis_products/triggers_nonlive");
        let names: Vec<String> = std::fs::read_dir(&trigger_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        for suffix in [
            "_mapDifference.rgb",
            "_mapExcludedPixels.rgb",
            "_mapTrigger.rgb",
            "_triggerFrame.rgb",
            "_previousFrame.rgb",
        ] {
            assert!(
                names.iter().any(|n| n.ends_with(suffix)),
                "missing {suffix} in {names:?}"
            );
            let txt = suffix.replace(".rgb", ".txt");
            assert!(names.iter().any(|n| n.ends_with(&txt)), "missing {txt}");
        }
    }

    #[test]
    fn test_nearby_candidate_extends_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker(dir.path());
        let mut detector = MotionDetector::new(WIDTH, HEIGHT);

        let (candidates, new, old) = scan_rect(&mut detector, 50, 200);
        tracker.register(&candidates[0], &mut detector, 10, 1000.0, &new, &old, 2.0, 40.0);
        let (candidates, new, old) = scan_rect(&mut detector, 56, 200);
        tracker.register(&candidates[0], &mut detector, 11, 1000.04, &new, &old, 2.0, 40.0);

        // Same object, one event.
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.events[0].detections.len(), 2);
        // Moved 6 px with 2 detections: confirmed, clip open.
        assert!(tracker.events[0].confirmed);
        assert!(tracker.events[0].clip.writer.is_some());
        // Pre-roll cursor points 5 frames before the first detection.
        assert_eq!(tracker.events[0].clip.write_cursor, 5);
    }

    #[test]
    fn test_stationary_track_is_never_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker(dir.path());
        let mut detector = MotionDetector::new(WIDTH, HEIGHT);

        let (candidates, new, old) = scan_rect(&mut detector, 50, 200);
        tracker.register(&candidates[0], &mut detector, 10, 1000.0, &new, &old, 2.0, 40.0);
        let (candidates, new, old) = scan_rect(&mut detector, 51, 200);
        tracker.register(&candidates[0], &mut detector, 11, 1000.04, &new, &old, 2.0, 40.0);

        // Two detections but only ~1 px of movement.
        assert!(!tracker.events[0].confirmed);

        // Once it disappears past the suffix window it is silently dropped.
        let current = vec![40u8; WIDTH * HEIGHT];
        let closed = tracker.close_ended(20, 1000.4, &current, 2.0, 40.0);
        assert_eq!(closed, 0);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_confirmed_event_writes_composites_and_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker(dir.path());
        let mut detector = MotionDetector::new(WIDTH, HEIGHT);
        let mut ring = FrameRing::new(40, WIDTH * HEIGHT * 3 / 2);
        for counter in 0..30 {
            let slot = ring.slot(counter);
            ring.frame_mut(slot).fill(40);
        }

        let (candidates, new, old) = scan_rect(&mut detector, 50, 200);
        tracker.register(&candidates[0], &mut detector, 10, 1000.0, &new, &old, 2.0, 40.0);
        let (candidates, new, old) = scan_rect(&mut detector, 58, 200);
        tracker.register(&candidates[0], &mut detector, 11, 1000.04, &new, &old, 2.0, 40.0);
        assert!(tracker.events[0].confirmed);

        // No detections after frame 11: the close pass at frame 17 ends it
        // (11 + suffix 5 < 17).
        let current = vec![40u8; WIDTH * HEIGHT];
        for frame in 12..=17 {
            let closed = tracker.close_ended(frame, 1000.0 + frame as f64 / 25.0, &current, 2.0, 40.0);
            tracker.flush_clips(&ring, frame);
            if frame == 17 {
                assert_eq!(closed, 1);
            } else {
                assert_eq!(closed, 0);
            }
        }
        tracker.finalize(30, 1001.2, &ring, 2.0, 40.0);
        assert_eq!(tracker.active_count(), 0);

        let trigger_dir = dir.path().join("analysis_products/triggers_nonlive");
        let names: Vec<String> = std::fs::read_dir(&trigger_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        for suffix in ["_timeAverage.rgb", "_maxBrightness.rgb", "_allTriggers.rgb", ".vid"] {
            assert!(
                names.iter().any(|n| n.ends_with(suffix)),
                "missing {suffix} in {names:?}"
            );
        }

        // Clip runs from frame 5 (pre-roll) to frame 16 (last + suffix).
        let vid = std::fs::read_dir(&trigger_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "vid"))
            .unwrap();
        let bytes = std::fs::read(&vid).unwrap();
        let frame_bytes = WIDTH * HEIGHT * 3 / 2;
        assert_eq!((bytes.len() - 12) % frame_bytes, 0);
        assert_eq!((bytes.len() - 12) / frame_bytes, 12);

        // The video sidecar carries the detection path.
        let sidecar = vid.with_extension("txt");
        let text = std::fs::read_to_string(sidecar).unwrap();
        assert!(text.contains("semanticType pigazing:movingObject/video"));
        assert!(text.contains("detectionCount 2"));
        assert!(text.contains("path [["));
    }
}
