//! Grayscale frames and low-light preprocessing.

use std::time::Instant;

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;
/// Pixels below this luma count as near-black.
const DARK_LUMA: u8 = 32;

/// A grayscale frame, one byte per pixel, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a luma buffer; fails if it is shorter than `width × height`.
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data[..expected], DARK_FRAME_RATIO);
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// Apply CLAHE in place.
    pub fn enhance(&mut self, clahe: &Clahe) {
        clahe.apply(&mut self.data, self.width, self.height);
    }
}

/// Luma plane of packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let needed = pixels * 2;
    if yuyv.len() < needed {
        return Err(FrameError::InvalidLength {
            expected: needed,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..needed].chunks_exact(2).map(|px| px[0]).collect())
}

/// True when more than `ratio` of the pixels are near-black. Empty frames are dark.
pub fn is_dark_frame(gray: &[u8], ratio: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_LUMA).count();
    dark as f32 / gray.len() as f32 > ratio
}

/// Contrast-limited adaptive histogram equalization.
///
/// `clip_limit` is relative to a uniform histogram: each bin of a tile is
/// capped at `clip_limit × tile_pixels / 256` and the excess is spread
/// evenly over all bins. Tile mappings are blended bilinearly between
/// neighbouring tile centers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    pub clip_limit: f32,
    pub grid: u32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 3.5,
            grid: 8,
        }
    }
}

impl Clahe {
    pub fn apply(&self, gray: &mut [u8], width: u32, height: u32) {
        let (w, h) = (width as usize, height as usize);
        let grid = self.grid.max(1) as usize;
        if w == 0 || h == 0 || gray.len() < w * h {
            return;
        }
        let tile_w = w.div_ceil(grid);
        let tile_h = h.div_ceil(grid);
        let tiles_x = w.div_ceil(tile_w);
        let tiles_y = h.div_ceil(tile_h);

        let mut luts: Vec<[u8; 256]> = Vec::with_capacity(tiles_x * tiles_y);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let x_end = ((tx + 1) * tile_w).min(w);
                let y_end = ((ty + 1) * tile_h).min(h);
                let mut hist = [0u32; 256];
                for y in ty * tile_h..y_end {
                    for &p in &gray[y * w + tx * tile_w..y * w + x_end] {
                        hist[p as usize] += 1;
                    }
                }
                let area = ((x_end - tx * tile_w) * (y_end - ty * tile_h)) as u32;
                luts.push(self.tile_lut(&mut hist, area));
            }
        }

        for y in 0..h {
            let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
            let (r0, r1, dy) = neighbours(gy, tiles_y);
            for x in 0..w {
                let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
                let (c0, c1, dx) = neighbours(gx, tiles_x);
                let p = gray[y * w + x] as usize;
                let top = luts[r0 * tiles_x + c0][p] as f32 * (1.0 - dx) + luts[r0 * tiles_x + c1][p] as f32 * dx;
                let bottom = luts[r1 * tiles_x + c0][p] as f32 * (1.0 - dx) + luts[r1 * tiles_x + c1][p] as f32 * dx;
                gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    fn tile_lut(&self, hist: &mut [u32; 256], area: u32) -> [u8; 256] {
        let mut lut = [0u8; 256];
        if area == 0 {
            return lut;
        }
        if self.clip_limit > 0.0 {
            let clip = ((self.clip_limit * area as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let spread = excess / 256;
            let remainder = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += spread + u32::from(i < remainder);
            }
        }
        let scale = 255.0 / area as f32;
        let mut running = 0u32;
        for (value, &count) in lut.iter_mut().zip(hist.iter()) {
            running += count;
            *value = (running as f32 * scale).round().min(255.0) as u8;
        }
        lut
    }
}

/// Two tile indices around fractional grid coordinate `g` and the blend weight.
fn neighbours(g: f32, tiles: usize) -> (usize, usize, f32) {
    let last = tiles.saturating_sub(1);
    if g <= 0.0 {
        return (0, 0, 0.0);
    }
    let lo = (g.floor() as usize).min(last);
    let hi = (lo + 1).min(last);
    (lo, hi, if hi == lo { 0.0 } else { g - lo as f32 })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
