//! Frame sources.
//!
//! A [`FrameSource`] hands the observer one planar YUV420 frame per call,
//! stamped with a capture time in UTC seconds. Live capture devices are
//! external to this crate; the built-in [`RawVideoSource`] replays the same
//! raw `.vid` container the clip emitter writes, which is how pre-recorded
//! observations are re-analysed and how the test suite drives the pipeline.
//!
//! # File Format
//!
//! ```text
//! [i32 native: total byte length][i32 native: width][i32 native: height]
//! followed by concatenated YUV420 frames of width * height * 3/2 bytes
//! ```

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

use crate::yuv;

/// Errors that can occur while reading frames.
#[derive(Error, Debug)]
pub enum SourceError {
    /// File not found or cannot be opened.
    #[error("failed to open video file: {0}")]
    Io(#[from] std::io::Error),

    /// The container header is malformed.
    #[error("invalid video header: {0}")]
    InvalidHeader(String),

    /// The source cannot satisfy a rewind request.
    #[error("source cannot rewind")]
    CannotRewind,
}

/// Result type alias for frame source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Supplies one planar YUV420 frame per call with a monotonic capture time.
///
/// `fetch` fills the caller's buffer (at least `width * height * 3/2` bytes)
/// and returns the frame's UTC timestamp in seconds, or `None` at end of
/// stream. A live source may block until the next frame is ready; a file
/// source returns immediately.
pub trait FrameSource {
    /// Frame width in pixels.
    fn width(&self) -> usize;

    /// Frame height in pixels.
    fn height(&self) -> usize;

    /// Fetch the next frame into `buf`.
    ///
    /// Returns `Ok(Some(utc))` on success, `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` on a permanent device or I/O failure.
    fn fetch(&mut self, buf: &mut [u8]) -> Result<Option<f64>>;

    /// Restart the stream from the beginning, if the source supports it.
    ///
    /// File sources re-open the underlying stream and return the timestamp
    /// of the first frame; live sources return `Ok(None)` without side
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if a rewindable source fails to seek.
    fn rewind(&mut self) -> Result<Option<f64>>;
}

/// Size of the `.vid` container header in bytes (three native i32 fields).
const VID_HEADER_BYTES: u64 = 12;

/// Replays a raw `.vid` video file as a frame source.
///
/// The container does not carry timestamps, so frames are stamped
/// synthetically at `start_utc + index / fps`.
pub struct RawVideoSource {
    reader: BufReader<File>,
    width: usize,
    height: usize,
    frame_bytes: usize,
    fps: f64,
    start_utc: f64,
    frames_read: usize,
}

impl RawVideoSource {
    /// Open a raw video file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the `.vid` file.
    /// * `fps` - Frame rate the recording was made at.
    /// * `start_utc` - UTC second of the first frame.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Io` if the file cannot be opened and
    /// `SourceError::InvalidHeader` if the header fields are implausible.
    pub fn open(path: &Path, fps: f64, start_utc: f64) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let _total_bytes = read_i32(&mut reader)?;
        let width = read_i32(&mut reader)?;
        let height = read_i32(&mut reader)?;

        if width <= 0 || height <= 0 || width > 16384 || height > 16384 {
            return Err(SourceError::InvalidHeader(format!(
                "implausible frame geometry {width}x{height}"
            )));
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(SourceError::InvalidHeader(format!(
                "YUV420 needs even dimensions, got {width}x{height}"
            )));
        }

        let width = width as usize;
        let height = height as usize;
        log::info!(
            "Opened raw video {}: {}x{} at {} fps",
            path.display(),
            width,
            height,
            fps
        );

        Ok(Self {
            reader,
            width,
            height,
            frame_bytes: yuv::frame_bytes(width, height),
            fps,
            start_utc,
            frames_read: 0,
        })
    }

    /// Number of frames fetched since open or the last rewind.
    #[must_use]
    pub fn frames_read(&self) -> usize {
        self.frames_read
    }
}

impl FrameSource for RawVideoSource {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn fetch(&mut self, buf: &mut [u8]) -> Result<Option<f64>> {
        let frame = &mut buf[..self.frame_bytes];
        match self.reader.read_exact(frame) {
            Ok(()) => {
                let utc = self.start_utc + self.frames_read as f64 / self.fps;
                self.frames_read += 1;
                Ok(Some(utc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(SourceError::Io(e)),
        }
    }

    fn rewind(&mut self) -> Result<Option<f64>> {
        self.reader.seek(SeekFrom::Start(VID_HEADER_BYTES))?;
        self.frames_read = 0;
        log::debug!("Raw video source rewound to first frame");
        Ok(Some(self.start_utc))
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut bytes = [0u8; 4];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| SourceError::InvalidHeader("truncated header".into()))?;
    Ok(i32::from_ne_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_vid(path: &Path, width: i32, height: i32, frames: &[Vec<u8>]) {
        let frame_bytes = (width * height * 3 / 2) as usize;
        let total = 12 + frames.len() * frame_bytes;
        let mut file = File::create(path).unwrap();
        file.write_all(&(total as i32).to_ne_bytes()).unwrap();
        file.write_all(&width.to_ne_bytes()).unwrap();
        file.write_all(&height.to_ne_bytes()).unwrap();
        for frame in frames {
            file.write_all(frame).unwrap();
        }
    }

    #[test]
    fn test_open_and_fetch_all_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vid");
        let frame_bytes = yuv::frame_bytes(4, 2);
        let frames = vec![vec![10u8; frame_bytes], vec![20u8; frame_bytes]];
        write_vid(&path, 4, 2, &frames);

        let mut source = RawVideoSource::open(&path, 25.0, 1000.0).unwrap();
        assert_eq!(source.width(), 4);
        assert_eq!(source.height(), 2);

        let mut buf = vec![0u8; frame_bytes];
        let utc0 = source.fetch(&mut buf).unwrap();
        assert_eq!(utc0, Some(1000.0));
        assert_eq!(buf[0], 10);

        let utc1 = source.fetch(&mut buf).unwrap();
        assert_eq!(utc1, Some(1000.0 + 1.0 / 25.0));
        assert_eq!(buf[0], 20);

        assert_eq!(source.fetch(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_rewind_restarts_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vid");
        let frame_bytes = yuv::frame_bytes(4, 2);
        write_vid(&path, 4, 2, &[vec![7u8; frame_bytes]]);

        let mut source = RawVideoSource::open(&path, 10.0, 500.0).unwrap();
        let mut buf = vec![0u8; frame_bytes];
        source.fetch(&mut buf).unwrap();
        assert_eq!(source.fetch(&mut buf).unwrap(), None);

        assert_eq!(source.rewind().unwrap(), Some(500.0));
        assert_eq!(source.fetch(&mut buf).unwrap(), Some(500.0));
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn test_rejects_odd_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.vid");
        write_vid(&path, 5, 3, &[]);

        let result = RawVideoSource::open(&path, 25.0, 0.0);
        assert!(matches!(result, Err(SourceError::InvalidHeader(_))));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.vid");
        std::fs::write(&path, [0u8; 6]).unwrap();

        let result = RawVideoSource::open(&path, 25.0, 0.0);
        assert!(matches!(result, Err(SourceError::InvalidHeader(_))));
    }
}
