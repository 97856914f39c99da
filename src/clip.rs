//! Raw video clip output.
//!
//! Confirmed events are written out as `.vid` files: a three-field native
//! i32 header followed by concatenated YUV420 frames, the same container
//! [`crate::source::RawVideoSource`] replays. Frames stream from the ring
//! buffer a few per observer iteration, so a clip's total length is only
//! known when the event's end cursor is reached; the header length field is
//! back-patched at that point.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::products::{ProductError, Result};

/// Incremental writer for one event's `.vid` clip.
pub struct ClipWriter {
    file: File,
    path: PathBuf,
    frame_bytes: usize,
    frames_written: usize,
}

impl ClipWriter {
    /// Create the clip file and write its header.
    ///
    /// The length field is written as zero and patched by [`Self::finish`].
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` if the file cannot be created.
    pub fn create(path: &Path, width: usize, height: usize) -> Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(&0i32.to_ne_bytes())?;
        file.write_all(&(width as i32).to_ne_bytes())?;
        file.write_all(&(height as i32).to_ne_bytes())?;
        log::info!("Recording clip {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            frame_bytes: width * height * 3 / 2,
            frames_written: 0,
        })
    }

    /// Append one raw YUV420 frame.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` on write failure.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        debug_assert_eq!(frame.len(), self.frame_bytes);
        self.file.write_all(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Frames appended so far.
    #[must_use]
    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// The path of the clip file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Patch the header length field and close the file.
    ///
    /// Returns the number of frames written.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` if the patch or flush fails.
    pub fn finish(mut self) -> Result<usize> {
        let total_bytes = 12 + self.frames_written * self.frame_bytes;
        let total = i32::try_from(total_bytes)
            .map_err(|_| ProductError::InvalidPath(format!("clip too large: {total_bytes} bytes")))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&total.to_ne_bytes())?;
        self.file.flush()?;
        log::info!(
            "Closed clip {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        Ok(self.frames_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FrameSource, RawVideoSource};

    #[test]
    fn test_clip_round_trips_through_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.vid");
        let frame_bytes = 4 * 2 * 3 / 2;

        let mut writer = ClipWriter::create(&path, 4, 2).unwrap();
        writer.write_frame(&vec![11u8; frame_bytes]).unwrap();
        writer.write_frame(&vec![22u8; frame_bytes]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let mut source = RawVideoSource::open(&path, 25.0, 0.0).unwrap();
        let mut buf = vec![0u8; frame_bytes];
        assert!(source.fetch(&mut buf).unwrap().is_some());
        assert_eq!(buf[0], 11);
        assert!(source.fetch(&mut buf).unwrap().is_some());
        assert_eq!(buf[0], 22);
        assert!(source.fetch(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_header_length_is_patched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.vid");
        let frame_bytes = 4 * 2 * 3 / 2;

        let mut writer = ClipWriter::create(&path, 4, 2).unwrap();
        for _ in 0..3 {
            writer.write_frame(&vec![0u8; frame_bytes]).unwrap();
        }
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let declared = i32::from_ne_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, bytes.len());
        assert_eq!(declared, 12 + 3 * frame_bytes);
    }
}
