//! Contrast-limited adaptive histogram equalization on 8-bit gray images.
//!
//! Tiles are equalized independently with a clipped histogram; each output pixel is a
//! bilinear blend of the four nearest tile LUTs. When the image does not divide evenly
//! into the grid, histograms are taken over a reflect-101 padded extent.

use image::GrayImage;

const HIST_BINS: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Clahe {
    /// Relative clip limit; `<= 0` disables clipping (plain tiled equalization).
    pub clip_limit: f32,
    /// Tile grid as (columns, rows).
    pub tile_grid: (u32, u32),
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: (8, 8),
        }
    }
}

impl Clahe {
    pub fn new(clip_limit: f32, tile_grid: (u32, u32)) -> Self {
        Self {
            clip_limit,
            tile_grid,
        }
    }

    pub fn apply(&self, img: &GrayImage) -> GrayImage {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return img.clone();
        }
        let tiles_x = self.tile_grid.0.max(1);
        let tiles_y = self.tile_grid.1.max(1);
        let ext_w = round_up(width, tiles_x);
        let ext_h = round_up(height, tiles_y);
        let tile_w = ext_w / tiles_x;
        let tile_h = ext_h / tiles_y;
        let tile_area = (tile_w * tile_h) as usize;

        let clip = if self.clip_limit > 0.0 {
            ((self.clip_limit * tile_area as f32 / HIST_BINS as f32) as usize).max(1)
        } else {
            0
        };
        let lut_scale = 255.0 / tile_area as f32;

        let mut luts = vec![[0u8; HIST_BINS]; (tiles_x * tiles_y) as usize];
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let mut hist = [0usize; HIST_BINS];
                for y in ty * tile_h..(ty + 1) * tile_h {
                    let sy = reflect101(y, height);
                    for x in tx * tile_w..(tx + 1) * tile_w {
                        let sx = reflect101(x, width);
                        hist[img.get_pixel(sx, sy)[0] as usize] += 1;
                    }
                }
                if clip > 0 {
                    clip_histogram(&mut hist, clip);
                }
                let lut = &mut luts[(ty * tiles_x + tx) as usize];
                let mut sum = 0usize;
                for (bin, count) in hist.iter().enumerate() {
                    sum += count;
                    lut[bin] = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
                }
            }
        }

        let inv_tw = 1.0 / tile_w as f32;
        let inv_th = 1.0 / tile_h as f32;
        let mut out = GrayImage::new(width, height);
        for y in 0..height {
            let (ty1, ty2, ya) = neighbours(y, inv_th, tiles_y);
            for x in 0..width {
                let (tx1, tx2, xa) = neighbours(x, inv_tw, tiles_x);
                let v = img.get_pixel(x, y)[0] as usize;
                let l11 = luts[ty1 * tiles_x as usize + tx1][v] as f32;
                let l12 = luts[ty1 * tiles_x as usize + tx2][v] as f32;
                let l21 = luts[ty2 * tiles_x as usize + tx1][v] as f32;
                let l22 = luts[ty2 * tiles_x as usize + tx2][v] as f32;
                let res = (l11 * (1.0 - xa) + l12 * xa) * (1.0 - ya)
                    + (l21 * (1.0 - xa) + l22 * xa) * ya;
                out.put_pixel(x, y, image::Luma([res.round().clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }
}

fn round_up(len: u32, tiles: u32) -> u32 {
    if len % tiles == 0 {
        len
    } else {
        len + tiles - len % tiles
    }
}

/// Reflect-101 index into `0..len` (edge pixel is not repeated).
fn reflect101(i: u32, len: u32) -> u32 {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let i = i % period;
    if i < len {
        i
    } else {
        period - i
    }
}

/// Returns (lower tile, upper tile, weight of upper) for a pixel coordinate.
fn neighbours(pos: u32, inv_tile: f32, tiles: u32) -> (usize, usize, f32) {
    let f = pos as f32 * inv_tile - 0.5;
    let lower = f.floor();
    let weight = f - lower;
    let lower = lower as i64;
    let upper = (lower + 1).min(tiles as i64 - 1);
    (lower.max(0) as usize, upper.max(0) as usize, weight)
}

fn clip_histogram(hist: &mut [usize; HIST_BINS], clip: usize) {
    let mut clipped = 0usize;
    for count in hist.iter_mut() {
        if *count > clip {
            clipped += *count - clip;
            *count = clip;
        }
    }
    let batch = clipped / HIST_BINS;
    let mut residual = clipped - batch * HIST_BINS;
    for count in hist.iter_mut() {
        *count += batch;
    }
    if residual > 0 {
        let step = (HIST_BINS / residual).max(1);
        let mut i = 0;
        while i < HIST_BINS && residual > 0 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_image_stays_constant() {
        let img = GrayImage::from_pixel(224, 224, image::Luma([128]));
        let out = Clahe::default().apply(&img);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn unclipped_two_level_tiles_stretch_to_full_range() {
        let img = GrayImage::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                image::Luma([100])
            } else {
                image::Luma([110])
            }
        });
        let out = Clahe::new(0.0, (2, 2)).apply(&img);
        for (x, y, p) in out.enumerate_pixels() {
            let expected = if (x + y) % 2 == 0 { 128 } else { 255 };
            assert_eq!(p[0], expected, "pixel ({x},{y})");
        }
    }

    #[test]
    fn uneven_dimensions_keep_shape() {
        let img = GrayImage::from_fn(37, 23, |x, y| image::Luma([((x * 7 + y * 3) % 256) as u8]));
        let out = Clahe::default().apply(&img);
        assert_eq!(out.dimensions(), (37, 23));
    }

    #[test]
    fn clipping_preserves_histogram_mass() {
        let mut hist = [0usize; HIST_BINS];
        hist[10] = 500;
        hist[20] = 284;
        clip_histogram(&mut hist, 6);
        assert_eq!(hist.iter().sum::<usize>(), 784);
    }

    #[test]
    fn reflect101_mirrors_without_repeating_edge() {
        assert_eq!(reflect101(4, 5), 4);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
    }
}
