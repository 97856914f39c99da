//! Skywatch - continuous sky-camera analysis pipeline.
//!
//! Ingests an uncompressed planar YUV420 video stream from a fixed camera
//! pointed at the night sky and emits two families of products:
//!
//! - periodic long-exposure time-lapse stacks of the sky, straight and with
//!   the modelled sky background subtracted;
//! - for each detected transient (meteor, satellite, aircraft), a video
//!   clip with pre- and post-roll plus forensic stills and composites.
//!
//! A rolling per-pixel model of the sky background is maintained
//! throughout and used both to flatten time-lapse stacks and to suppress
//! false triggers from stars and hot pixels.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource → FrameRing → MotionDetector → EventTracker → clips/stills
//!                  ↘ BackgroundModel ↘ time-lapse stacker → stacks
//! ```
//!
//! The [`observer::Observer`] drives all components from a single
//! cooperative loop, one frame per iteration.

pub mod background;
pub mod clip;
pub mod config;
pub mod events;
pub mod mask;
pub mod noise;
pub mod observer;
pub mod products;
pub mod ring;
pub mod source;
pub mod test_utils;
pub mod trigger;
pub mod yuv;
