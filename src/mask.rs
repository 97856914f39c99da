//! Trigger mask.
//!
//! The mask marks which pixels may contribute to trigger tests; everything
//! outside it (rooftops, trees, street lights) is ignored by the motion
//! detector. Masks are loaded from a text file of polygon vertices: one
//! `x y` pair per line, polygons separated by blank lines, `#` starting a
//! comment. Each polygon is rasterised with an even-odd scanline fill. A
//! file that fills no pixels yields an all-ones mask, so triggering covers
//! the whole frame by default.

use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a mask file.
#[derive(Error, Debug)]
pub enum MaskError {
    /// File not found or cannot be read.
    #[error("failed to read mask file: {0}")]
    Io(#[from] std::io::Error),

    /// A vertex line could not be parsed.
    #[error("invalid mask file line {line}: {message}")]
    Parse {
        /// 1-based line number of the offending line.
        line: usize,
        /// Description of the problem.
        message: String,
    },
}

/// Result type alias for mask operations.
pub type Result<T> = std::result::Result<T, MaskError>;

/// Per-pixel byte mask; non-zero means "consider this pixel".
#[derive(Debug, Clone)]
pub struct Mask {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Mask {
    /// An all-ones mask covering the whole frame.
    #[must_use]
    pub fn allow_all(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![1; width * height],
        }
    }

    /// Load a mask from a polygon vertex file.
    ///
    /// # Errors
    ///
    /// Returns `MaskError::Io` if the file cannot be read and
    /// `MaskError::Parse` if a non-blank, non-comment line is not an
    /// `x y` pair.
    pub fn from_polygon_file(path: &Path, width: usize, height: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut mask = Self {
            width,
            height,
            pixels: vec![0; width * height],
        };

        let mut polygon: Vec<(f64, f64)> = Vec::new();
        let mut filled = 0usize;
        for (index, raw_line) in text.lines().chain(std::iter::once("")).enumerate() {
            let line = raw_line.trim();
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() {
                if polygon.len() > 2 {
                    filled += mask.fill_polygon(&polygon);
                }
                polygon.clear();
                continue;
            }

            let mut parts = line.split_whitespace();
            let x = parse_coord(parts.next(), index)?;
            let y = parse_coord(parts.next(), index)?;
            polygon.push((x, y));
        }

        if filled == 0 {
            // No clipping region specified: allow triggers across the frame.
            mask.pixels.fill(1);
        }
        log::info!(
            "Loaded mask from {}: {} of {} pixels enabled",
            path.display(),
            mask.enabled_count(),
            width * height
        );
        Ok(mask)
    }

    /// Frame width in pixels.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// The raw per-pixel bytes, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Whether the pixel at linear offset `o` may trigger.
    #[inline]
    #[must_use]
    pub fn enabled(&self, o: usize) -> bool {
        self.pixels[o] != 0
    }

    /// Number of enabled pixels.
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p != 0).count()
    }

    /// Even-odd scanline fill of one polygon; returns the pixel count filled.
    fn fill_polygon(&mut self, corners: &[(f64, f64)]) -> usize {
        let mut filled = 0usize;
        let mut nodes: Vec<i64> = Vec::with_capacity(corners.len());

        for row in 0..self.height {
            let y = row as f64;
            nodes.clear();

            // Collect the x positions where polygon edges cross this row.
            let mut j = corners.len() - 1;
            for i in 0..corners.len() {
                let (xi, yi) = corners[i];
                let (xj, yj) = corners[j];
                if (yi < y && yj >= y) || (yj < y && yi >= y) {
                    nodes.push((xi + (y - yi) / (yj - yi) * (xj - xi)) as i64);
                }
                j = i;
            }
            nodes.sort_unstable();

            // Fill between node pairs.
            for pair in nodes.chunks_exact(2) {
                let start = pair[0].clamp(0, self.width as i64) as usize;
                let stop = pair[1].clamp(0, self.width as i64) as usize;
                for x in start..stop {
                    let o = row * self.width + x;
                    if self.pixels[o] == 0 {
                        self.pixels[o] = 1;
                        filled += 1;
                    }
                }
            }
        }
        filled
    }
}

fn parse_coord(field: Option<&str>, index: usize) -> Result<f64> {
    let field = field.ok_or(MaskError::Parse {
        line: index + 1,
        message: "expected two coordinates".into(),
    })?;
    field.parse().map_err(|_| MaskError::Parse {
        line: index + 1,
        message: format!("not a number: {field}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let mask = Mask::allow_all(4, 3);
        assert_eq!(mask.enabled_count(), 12);
        assert!(mask.enabled(0));
        assert!(mask.enabled(11));
    }

    #[test]
    fn test_square_polygon_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.txt");
        std::fs::write(
            &path,
            "# square covering the left half\n2 2\n2 8\n5 8\n5 2\n",
        )
        .unwrap();

        let mask = Mask::from_polygon_file(&path, 10, 10).unwrap();
        assert!(mask.enabled(4 * 10 + 3));
        assert!(!mask.enabled(4 * 10 + 8));
        assert!(!mask.enabled(0));
        // 3 columns x 6 rows
        assert_eq!(mask.enabled_count(), 18);
    }

    #[test]
    fn test_empty_file_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.txt");
        std::fs::write(&path, "# nothing here\n").unwrap();

        let mask = Mask::from_polygon_file(&path, 6, 6).unwrap();
        assert_eq!(mask.enabled_count(), 36);
    }

    #[test]
    fn test_two_polygons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.txt");
        std::fs::write(&path, "0 0\n0 4\n4 4\n4 0\n\n6 6\n6 9\n9 9\n9 6\n").unwrap();

        let mask = Mask::from_polygon_file(&path, 10, 10).unwrap();
        assert!(mask.enabled(2 * 10 + 2));
        assert!(mask.enabled(7 * 10 + 7));
        assert!(!mask.enabled(5 * 10 + 5));
    }

    #[test]
    fn test_bad_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.txt");
        std::fs::write(&path, "1 2\nthree four\n5 6\n").unwrap();

        let result = Mask::from_polygon_file(&path, 10, 10);
        assert!(matches!(result, Err(MaskError::Parse { line: 2, .. })));
    }
}
