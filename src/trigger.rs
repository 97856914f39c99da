//! Motion detection over frame pairs.
//!
//! Two luminance planes separated by a fixed lag are differenced; pixels
//! that brightened past an adaptive threshold, and that pass a pair of
//! spatial gates suppressing full-frame changes, are grouped into connected
//! blocks. Blocks that are bright, large and tall enough become candidate
//! detections for the event tracker.
//!
//! A cumulative per-pixel map of past triggers down-weights chronic
//! offenders (twinkling stars, waving trees, hot pixels): pixels that
//! trigger far more often than the frame average are still painted into the
//! diagnostic maps but no longer contribute to block statistics.

use crate::mask::Mask;

/// Pixels at each frame edge excluded from the scan.
pub const EDGE_MARGIN: usize = 20;

/// Spacing of the 3x3 spatial comparison grid, in pixels.
pub const NEIGHBOUR_SPACING: usize = 16;

/// Upper bound on the number of blocks labelled per frame.
pub const MAX_BLOCKS: usize = 65536;

/// Connected pixels required before a block can trigger.
const MIN_BLOCK_PIXELS: i32 = 7;

/// A block's bounding box must span at least this many rows beyond its top.
const MIN_BLOCK_ROW_SPAN: i32 = 2;

/// Pixels triggering more than this multiple of the frame-average trigger
/// rate are excluded from block statistics.
const CHRONIC_FACTOR: f64 = 2.3;

/// A qualifying block, dispatched to the event tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Root block id in this frame's trigger map.
    pub block_id: u32,
    /// Intensity-weighted mean column of the block.
    pub x: i32,
    /// Intensity-weighted mean row of the block.
    pub y: i32,
    /// Number of pixels contributing statistics.
    pub pixel_count: i32,
    /// Total brightness excess over the comparison frame.
    pub amplitude: i32,
}

/// Aggregate statistics of one connected block of triggered pixels.
#[derive(Debug, Clone, Copy, Default)]
struct Block {
    pixel_count: i32,
    top: i32,
    bot: i32,
    sum_x: i64,
    sum_y: i64,
    sum_excess: i64,
    /// Union-find parent; 0 = this block is a root.
    redirect: u32,
}

/// Per-pixel differencing, spatial gating and block labelling state.
pub struct MotionDetector {
    width: usize,
    height: usize,
    frame_size: usize,
    /// Cumulative count of triggers per pixel.
    past_trigger_map: Vec<u32>,
    /// Block id per pixel, regenerated every frame. 0 = unassigned.
    trigger_map: Vec<u32>,
    /// Diagnostic planes: difference, exclusion, trigger (one byte each).
    diagnostic_rgb: Vec<u8>,
    /// Block arena, indexed by block id; entry 0 is a sentinel.
    blocks: Vec<Block>,
    /// Rolling mean of the past-trigger map over mask-enabled pixels.
    past_average: u64,
}

impl MotionDetector {
    /// Allocate detector state for the given frame geometry.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        let frame_size = width * height;
        let mut blocks = Vec::with_capacity(MAX_BLOCKS);
        blocks.push(Block::default());
        Self {
            width,
            height,
            frame_size,
            past_trigger_map: vec![0; frame_size],
            trigger_map: vec![0; frame_size],
            diagnostic_rgb: vec![0; frame_size * 3],
            blocks,
            past_average: 1,
        }
    }

    /// Difference two luminance planes and label triggered blocks.
    ///
    /// `image_new` is the current frame, `image_old` the frame
    /// `STACK_COMPARISON_INTERVAL` positions earlier in the ring. Returns
    /// the qualifying candidates; the trigger map and diagnostic planes
    /// remain valid until the next scan.
    pub fn scan(
        &mut self,
        image_new: &[u8],
        image_old: &[u8],
        mask: &Mask,
        noise_level: f64,
    ) -> Vec<Candidate> {
        let width = self.width;
        let frame_size = self.frame_size;

        let threshold_monitor = (2.0 * noise_level).max(1.0) as i32;
        let threshold_trigger = (3.5 * noise_level).max(1.0) as i32;
        let threshold_intensity = (100.0 * noise_level) as i64;
        let chronic_limit = CHRONIC_FACTOR * self.past_average as f64;
        let paint_limit = 3.0 * self.past_average as f64;

        self.trigger_map.fill(0);
        self.blocks.clear();
        self.blocks.push(Block::default());

        let (r_plane, rest) = self.diagnostic_rgb.split_at_mut(frame_size);
        let (g_plane, b_plane) = rest.split_at_mut(frame_size);

        // Feed the rolling average used by the chronic-pixel gate on the
        // next frame. The mask count starts at one to avoid division by
        // zero on fully masked frames.
        let mut past_sum: u64 = 0;
        let mut mask_count: u64 = 1;

        for y in EDGE_MARGIN..self.height - EDGE_MARGIN {
            for x in EDGE_MARGIN..width - EDGE_MARGIN {
                let o = y * width + x;
                let past = self.past_trigger_map[o];
                past_sum += past as u64;
                if mask.enabled(o) {
                    mask_count += 1;
                }

                let diff = image_new[o] as i32 - image_old[o] as i32;
                r_plane[o] = (diff * 64 / threshold_trigger).clamp(0, 255) as u8;
                g_plane[o] = ((past as f64 * 256.0 / chronic_limit) as i32).clamp(0, 255) as u8;
                b_plane[o] = 0;

                if !mask.enabled(o) || !test_pixel(image_new, image_old, o, width, threshold_monitor)
                {
                    continue;
                }
                self.past_trigger_map[o] += 1;
                if !test_pixel(image_new, image_old, o, width, threshold_trigger) {
                    continue;
                }
                self.past_trigger_map[o] += 1;
                let past = self.past_trigger_map[o] as f64;
                b_plane[o] = if past < paint_limit { 63 } else { 31 };

                // The scan is a raster sweep, so of the 8-neighbourhood only
                // the four already-visited pixels can carry a block id.
                let mut block_id = 0u32;
                for neighbour in [o - 1, o + 1 - width, o - width, o - 1 - width] {
                    let id = self.trigger_map[neighbour];
                    if id != 0 {
                        if block_id == 0 {
                            block_id = id;
                        } else {
                            merge_blocks(&mut self.blocks, id, block_id);
                        }
                    }
                }
                block_id = resolve(&self.blocks, block_id);

                if block_id == 0 {
                    if self.blocks.len() >= MAX_BLOCKS {
                        // Table full: drop this candidate pixel for the rest
                        // of the frame. Self-healing on the next scan.
                        continue;
                    }
                    self.blocks.push(Block {
                        top: y as i32,
                        bot: y as i32,
                        ..Block::default()
                    });
                    block_id = (self.blocks.len() - 1) as u32;
                }

                if past < chronic_limit {
                    let block = &mut self.blocks[block_id as usize];
                    block.pixel_count += 1;
                    block.top = block.top.min(y as i32);
                    block.bot = block.bot.max(y as i32);
                    block.sum_x += x as i64;
                    block.sum_y += y as i64;
                    block.sum_excess += diff as i64;
                }
                self.trigger_map[o] = block_id;
            }
        }

        let mut candidates = Vec::new();
        for (id, block) in self.blocks.iter().enumerate().skip(1) {
            if block.redirect != 0 {
                continue;
            }
            if block.sum_excess > threshold_intensity
                && block.pixel_count > MIN_BLOCK_PIXELS
                && block.bot - block.top >= MIN_BLOCK_ROW_SPAN
            {
                candidates.push(Candidate {
                    block_id: id as u32,
                    x: (block.sum_x / block.pixel_count as i64) as i32,
                    y: (block.sum_y / block.pixel_count as i64) as i32,
                    pixel_count: block.pixel_count,
                    amplitude: block.sum_excess as i32,
                });
            }
        }

        self.past_average = past_sum / mask_count + 1;
        candidates
    }

    /// Block id per pixel from the most recent scan.
    #[must_use]
    pub fn trigger_map(&self) -> &[u32] {
        &self.trigger_map
    }

    /// Walk a block id to its union-find root.
    #[must_use]
    pub fn block_root(&self, id: u32) -> u32 {
        resolve(&self.blocks, id)
    }

    /// Scaled frame difference from the most recent scan.
    #[must_use]
    pub fn difference_plane(&self) -> &[u8] {
        &self.diagnostic_rgb[..self.frame_size]
    }

    /// Map of pixels excluded for triggering too often.
    #[must_use]
    pub fn excluded_plane(&self) -> &[u8] {
        &self.diagnostic_rgb[self.frame_size..2 * self.frame_size]
    }

    /// Map of pixels that passed the trigger gate.
    #[must_use]
    pub fn trigger_plane(&self) -> &[u8] {
        &self.diagnostic_rgb[2 * self.frame_size..]
    }

    /// Brighten the trigger-plane pixels of one block, marking the block
    /// that fired in the diagnostic output.
    pub fn highlight_block(&mut self, root_id: u32) {
        let frame_size = self.frame_size;
        for o in 0..frame_size {
            let id = self.trigger_map[o];
            if id != 0 && resolve(&self.blocks, id) == root_id {
                let b = &mut self.diagnostic_rgb[2 * frame_size + o];
                *b = b.saturating_mul(4);
            }
        }
    }

    /// Rolling mean of the past-trigger map, as used by the chronic gate.
    #[must_use]
    pub fn past_average(&self) -> u64 {
        self.past_average
    }
}

/// Dual spatial gate for one pixel at linear offset `o`.
///
/// The pixel must have brightened against the old frame, must be brighter
/// than almost all of a 3x3 grid of old-frame pixels at
/// [`NEIGHBOUR_SPACING`], and must stand out against the same grid in the
/// new frame itself. The last test rejects frame-wide brightness changes
/// such as lightning or passing cloud.
#[inline]
fn test_pixel(image_new: &[u8], image_old: &[u8], o: usize, width: usize, threshold: i32) -> bool {
    let centre = image_new[o] as i32;
    if centre - image_old[o] as i32 <= threshold {
        return false;
    }

    let step = NEIGHBOUR_SPACING as isize;
    let width = width as isize;
    let o = o as isize;

    let mut count = 0;
    for i in -1isize..=1 {
        for j in -1isize..=1 {
            let p = (o + (j + i * width) * step) as usize;
            if centre - image_old[p] as i32 > threshold {
                count += 1;
            }
        }
    }
    if count <= 7 {
        return false;
    }

    let mut count = 0;
    for i in -1isize..=1 {
        for j in -1isize..=1 {
            let p = (o + (j + i * width) * step) as usize;
            if centre - image_new[p] as i32 > threshold {
                count += 1;
            }
        }
    }
    count > 6
}

fn resolve(blocks: &[Block], mut id: u32) -> u32 {
    while id != 0 && blocks[id as usize].redirect != 0 {
        id = blocks[id as usize].redirect;
    }
    id
}

/// Fold block `old` into block `new` when they turn out to be connected.
///
/// Redirect chains are short, so no path compression is performed.
fn merge_blocks(blocks: &mut Vec<Block>, old: u32, new: u32) {
    let old = resolve(blocks, old);
    let new = resolve(blocks, new);
    if old == new {
        return;
    }
    let from = blocks[old as usize];
    let to = &mut blocks[new as usize];
    to.pixel_count += from.pixel_count;
    to.top = to.top.min(from.top);
    to.bot = to.bot.max(from.bot);
    to.sum_x += from.sum_x;
    to.sum_y += from.sum_y;
    to.sum_excess += from.sum_excess;
    let from = &mut blocks[old as usize];
    from.pixel_count = 0;
    from.redirect = new;
}
