//! Output products: raw images, metadata sidecars, file naming.
//!
//! Every product is a pair of files: a raw image (or video) plus a text
//! sidecar with the same stem and a `.txt` extension carrying typed
//! `key value` metadata lines. Products are grouped under
//! `<output>/analysis_products/<category>_<label>/` and named
//! `YYYYMMDDhhmmss_<observatory>_<tag>`.
//!
//! # Raw image format
//!
//! ```text
//! [i32 native: width][i32 native: height][i32 native: channels]
//! followed by row-major, channel-planar u8 pixels
//! ```

use chrono::{TimeZone, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while writing products.
#[derive(Error, Debug)]
pub enum ProductError {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The product path has no file name to derive a sidecar from.
    #[error("invalid product path: {0}")]
    InvalidPath(String),
}

/// Result type alias for product operations.
pub type Result<T> = std::result::Result<T, ProductError>;

/// Typed metadata value for a sidecar line.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// Written verbatim.
    Str(String),
    /// Written in decimal.
    Int(i64),
    /// Written as `%.15e` scientific notation.
    Float(f64),
}

/// Ordered collection of metadata entries for one product.
///
/// Built with the chaining methods, then written next to the product file:
///
/// ```no_run
/// # use skywatch::products::Metadata;
/// # use std::path::Path;
/// Metadata::new()
///     .str("semanticType", "pigazing:timelapse")
///     .int("width", 720)
///     .float("utc", 1.5e9)
///     .write_beside(Path::new("out/frame_BS0.rgb"))
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, MetaValue)>,
}

impl Metadata {
    /// An empty metadata set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string entry.
    #[must_use]
    pub fn str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), MetaValue::Str(value.into())));
        self
    }

    /// Append an integer entry.
    #[must_use]
    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.entries.push((key.into(), MetaValue::Int(value)));
        self
    }

    /// Append a floating-point entry.
    #[must_use]
    pub fn float(mut self, key: &str, value: f64) -> Self {
        self.entries.push((key.into(), MetaValue::Float(value)));
        self
    }

    /// Write the sidecar next to `product`, swapping its extension to `.txt`.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::InvalidPath` if `product` has no file name,
    /// or `ProductError::Io` on write failure.
    pub fn write_beside(&self, product: &Path) -> Result<()> {
        if product.file_name().is_none() {
            return Err(ProductError::InvalidPath(product.display().to_string()));
        }
        let path = product.with_extension("txt");
        let mut file = BufWriter::new(File::create(&path)?);
        for (key, value) in &self.entries {
            match value {
                MetaValue::Str(s) => writeln!(file, "{key} {s}")?,
                MetaValue::Int(i) => writeln!(file, "{key} {i}")?,
                MetaValue::Float(f) => writeln!(file, "{key} {}", format_scientific(*f))?,
            }
        }
        file.flush()?;
        Ok(())
    }
}

/// Format a float like C's `%.15e`: 15 fractional digits and a two-digit
/// signed exponent.
#[must_use]
pub fn format_scientific(value: f64) -> String {
    let formatted = format!("{value:.15e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

/// Gain chosen for a normalised stack, plus the brightness sample it came
/// from.
#[derive(Debug, Clone, Copy)]
pub struct GainEstimate {
    /// Multiplicative gain in `1..=30`.
    pub gain: i32,
    /// Mean per-frame brightness of the sampled pixels.
    pub mean_level: f64,
}

/// Writes raw image products into the analysis directory tree.
#[derive(Debug, Clone)]
pub struct ProductWriter {
    output_dir: PathBuf,
    obstory_id: String,
    label: String,
}

impl ProductWriter {
    /// Create a writer rooted at `output_dir`.
    ///
    /// `label` distinguishes real-time from after-the-fact analysis runs
    /// ("live" / "nonlive") and suffixes every product directory.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, obstory_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            obstory_id: obstory_id.into(),
            label: label.into(),
        }
    }

    /// The observatory id stamped into filenames and metadata.
    #[must_use]
    pub fn obstory_id(&self) -> &str {
        &self.obstory_id
    }

    /// Build the time-stamped filename stub for a product, creating the
    /// enclosing directory if needed.
    ///
    /// The result has no extension; callers append their tag suffix
    /// (`BS0.rgb`, `_triggerFrame.rgb`, `.vid`, ...).
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` if the directory cannot be created.
    pub fn filename_stub(&self, utc: f64, category: &str, tag: &str) -> Result<PathBuf> {
        let dir = self
            .output_dir
            .join("analysis_products")
            .join(format!("{category}_{}", self.label));
        ensure_dir(&dir)?;
        Ok(dir.join(format!("{}_{}_{tag}", time_stamp(utc), self.obstory_id)))
    }

    /// Write a raw u8 image.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` on write failure.
    pub fn write_frame(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        channels: usize,
        pixels: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(pixels.len(), width * height * channels);
        let mut file = BufWriter::new(File::create(path)?);
        write_header(&mut file, width, height, channels)?;
        file.write_all(pixels)?;
        file.flush()?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Normalise an integer stack by its frame count, apply automatic gain,
    /// and write it as a raw u8 image.
    ///
    /// A `target_brightness` of zero disables gain (gain 1); the brightness
    /// sample is still taken so the mean level can be reported.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` on write failure.
    pub fn write_stacked_frame(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        channels: usize,
        stack: &[i32],
        frame_count: i32,
        target_brightness: i32,
    ) -> Result<GainEstimate> {
        let estimate = estimate_gain(stack, width * height, frame_count, target_brightness, None);
        let frame_count = frame_count.max(1) as i64;
        let gain = estimate.gain as i64;

        let mut file = BufWriter::new(File::create(path)?);
        write_header(&mut file, width, height, channels)?;
        let mut row = vec![0u8; width];
        for chunk_start in (0..stack.len()).step_by(width) {
            let chunk = &stack[chunk_start..(chunk_start + width).min(stack.len())];
            for (out, &value) in row.iter_mut().zip(chunk) {
                *out = clip256(value as i64 * gain / frame_count);
            }
            file.write_all(&row[..chunk.len()])?;
        }
        file.flush()?;
        log::debug!("Wrote {} (gain {})", path.display(), estimate.gain);
        Ok(estimate)
    }

    /// Like [`Self::write_stacked_frame`], but subtracting
    /// `frame_count * background` before normalisation.
    ///
    /// # Errors
    ///
    /// Returns `ProductError::Io` on write failure.
    pub fn write_subtracted_frame(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        channels: usize,
        stack: &[i32],
        frame_count: i32,
        target_brightness: i32,
        background: &[u8],
    ) -> Result<GainEstimate> {
        debug_assert_eq!(stack.len(), background.len());
        let estimate = estimate_gain(
            stack,
            width * height,
            frame_count,
            target_brightness,
            Some(background),
        );
        let frame_count = frame_count.max(1) as i64;
        let gain = estimate.gain as i64;

        let mut file = BufWriter::new(File::create(path)?);
        write_header(&mut file, width, height, channels)?;
        let mut row = vec![0u8; width];
        for chunk_start in (0..stack.len()).step_by(width) {
            let stop = (chunk_start + width).min(stack.len());
            for (out, i) in row.iter_mut().zip(chunk_start..stop) {
                let value = stack[i] as i64 - frame_count * background[i] as i64;
                *out = clip256(value * gain / frame_count);
            }
            file.write_all(&row[..stop - chunk_start])?;
        }
        file.flush()?;
        Ok(estimate)
    }
}

/// Read back a raw image file written by [`ProductWriter::write_frame`].
///
/// Mainly used by the test suite and downstream tooling.
///
/// # Errors
///
/// Returns `ProductError::Io` if the file cannot be read or is truncated.
pub fn read_frame(path: &Path) -> Result<(usize, usize, usize, Vec<u8>)> {
    use std::io::Read;
    let mut file = File::open(path)?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    let width = i32::from_ne_bytes(header[0..4].try_into().unwrap()) as usize;
    let height = i32::from_ne_bytes(header[4..8].try_into().unwrap()) as usize;
    let channels = i32::from_ne_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut pixels = vec![0u8; width * height * channels];
    file.read_exact(&mut pixels)?;
    Ok((width, height, channels, pixels))
}

fn write_header<W: Write>(file: &mut W, width: usize, height: usize, channels: usize) -> Result<()> {
    file.write_all(&(width as i32).to_ne_bytes())?;
    file.write_all(&(height as i32).to_ne_bytes())?;
    file.write_all(&(channels as i32).to_ne_bytes())?;
    Ok(())
}

/// Choose a gain from a sparse brightness sample of the first plane.
///
/// Every 199th pixel is sampled; the sum is seeded with 32 and the count
/// with 1, which damps the gain on nearly black frames.
fn estimate_gain(
    stack: &[i32],
    frame_size: usize,
    frame_count: i32,
    target_brightness: i32,
    background: Option<&[u8]>,
) -> GainEstimate {
    let frame_count = frame_count.max(1) as f64;
    let mut sum = 32.0f64;
    let mut points = 1usize;
    for i in (0..frame_size.min(stack.len())).step_by(199) {
        let level = match background {
            Some(bg) => (stack[i] as f64 - frame_count * bg[i] as f64).max(0.0),
            None => stack[i] as f64,
        };
        sum += level;
        points += 1;
    }
    let mean_level = sum / frame_count / points as f64;

    let mut gain = 1;
    if target_brightness > 0 && mean_level > 0.0 {
        gain = (target_brightness as f64 / mean_level) as i32;
        gain = gain.clamp(1, 30);
    }
    GainEstimate { gain, mean_level }
}

fn clip256(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

fn time_stamp(utc: f64) -> String {
    match Utc.timestamp_opt(utc.floor() as i64, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y%m%d%H%M%S").to_string(),
        _ => "00000000000000".to_string(),
    }
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_scientific_matches_c_layout() {
        assert_eq!(format_scientific(0.0), "0.000000000000000e+00");
        assert_eq!(format_scientific(1.0), "1.000000000000000e+00");
        assert_eq!(format_scientific(-2.5), "-2.500000000000000e+00");
        assert_eq!(format_scientific(1234.5), "1.234500000000000e+03");
        assert_eq!(format_scientific(0.0625), "6.250000000000000e-02");
    }

    #[test]
    fn test_raw_frame_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.rgb");
        let writer = ProductWriter::new(dir.path(), "obs0", "live");

        let pixels: Vec<u8> = (0..6 * 4).map(|i| i as u8).collect();
        writer.write_frame(&path, 6, 4, 1, &pixels).unwrap();

        let (w, h, c, back) = read_frame(&path).unwrap();
        assert_eq!((w, h, c), (6, 4, 1));
        assert_eq!(back, pixels);
    }

    #[test]
    fn test_sidecar_contents() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("frame_BS0.rgb");
        std::fs::write(&product, b"").unwrap();

        Metadata::new()
            .str("obstoryId", "obs0")
            .str("semanticType", "pigazing:timelapse")
            .int("width", 720)
            .float("utc", 1500000000.5)
            .write_beside(&product)
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("frame_BS0.txt")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "obstoryId obs0");
        assert_eq!(lines[1], "semanticType pigazing:timelapse");
        assert_eq!(lines[2], "width 720");
        assert_eq!(lines[3], "utc 1.500000000500000e+09");
    }

    #[test]
    fn test_filename_stub_layout() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ProductWriter::new(dir.path(), "obs0", "live");

        let stub = writer.filename_stub(0.0, "timelapse", "frame_").unwrap();
        let name = stub.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "19700101000000_obs0_frame_");
        assert!(stub
            .parent()
            .unwrap()
            .ends_with("analysis_products/timelapse_live"));
        assert!(stub.parent().unwrap().is_dir());
    }

    #[test]
    fn test_stacked_frame_normalisation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.rgb");
        let writer = ProductWriter::new(dir.path(), "obs0", "live");

        // 10 frames of value 40 summed: normalises back to 40 at gain 1.
        let stack = vec![400i32; 8 * 4];
        let estimate = writer
            .write_stacked_frame(&path, 8, 4, 1, &stack, 10, 0)
            .unwrap();
        assert_eq!(estimate.gain, 1);

        let (_, _, _, pixels) = read_frame(&path).unwrap();
        assert!(pixels.iter().all(|&p| p == 40));
    }

    #[test]
    fn test_gain_raises_dim_stacks() {
        let stack = vec![40i32; 4000];
        let estimate = estimate_gain(&stack, 4000, 10, 32, None);
        // Mean level 4 against a target of 32: gain 8.
        assert!((estimate.mean_level - 4.0).abs() < 0.5);
        assert_eq!(estimate.gain, 8);
    }

    #[test]
    fn test_gain_is_clamped() {
        let dim = vec![1i32; 4000];
        assert_eq!(estimate_gain(&dim, 4000, 10, 255, None).gain, 30);
        let bright = vec![2550i32; 4000];
        assert_eq!(estimate_gain(&bright, 4000, 10, 32, None).gain, 1);
    }

    #[test]
    fn test_subtracted_frame_clips_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub.rgb");
        let writer = ProductWriter::new(dir.path(), "obs0", "live");

        let stack = vec![400i32; 8 * 4];
        let background = vec![41u8; 8 * 4];
        writer
            .write_subtracted_frame(&path, 8, 4, 1, &stack, 10, 0, &background)
            .unwrap();

        let (_, _, _, pixels) = read_frame(&path).unwrap();
        assert!(pixels.iter().all(|&p| p == 0));
    }
}
