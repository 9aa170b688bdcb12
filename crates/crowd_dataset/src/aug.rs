//! Random geometric augmentation for training samples.
//!
//! Each draw composes rotation, per-axis zoom, and translation about the image centre,
//! resamples bilinearly with edge clamping ("nearest" fill), then optionally mirrors
//! horizontally. The same transform is applied to every channel plane.

use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Maximum absolute rotation in degrees.
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of width.
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of height.
    pub height_shift_range: f32,
    /// Zoom factors are drawn from `[1 - zoom_range, 1 + zoom_range]` per axis.
    pub zoom_range: f32,
    /// Mirror horizontally with probability 0.5.
    pub horizontal_flip: bool,
    /// Seed for reproducible draws; mixed with the per-sample key.
    pub seed: Option<u64>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            width_shift_range: 0.4,
            height_shift_range: 0.4,
            zoom_range: 0.4,
            horizontal_flip: true,
            seed: None,
        }
    }
}

impl AugmentConfig {
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            seed: None,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.rotation_range <= 0.0
            && self.width_shift_range <= 0.0
            && self.height_shift_range <= 0.0
            && self.zoom_range <= 0.0
            && !self.horizontal_flip
    }

    pub fn describe(&self) -> String {
        format!(
            "rotation=±{:.1}° shift=({:.2},{:.2}) zoom=±{:.2} hflip={} seed={}",
            self.rotation_range,
            self.width_shift_range,
            self.height_shift_range,
            self.zoom_range,
            self.horizontal_flip,
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }
}

/// One drawn transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineDraw {
    pub theta: f32,
    pub tx: f32,
    pub ty: f32,
    pub zx: f32,
    pub zy: f32,
    pub flip: bool,
}

impl AffineDraw {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            tx: 0.0,
            ty: 0.0,
            zx: 1.0,
            zy: 1.0,
            flip: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Augmenter {
    cfg: AugmentConfig,
}

impl Augmenter {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.cfg
    }

    /// Augment a CHW buffer. `key` distinguishes draws (e.g. epoch and sample index).
    pub fn apply(&self, chw: &[f32], width: usize, height: usize, key: u64) -> Vec<f32> {
        if self.cfg.is_identity() {
            return chw.to_vec();
        }
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.cfg.seed {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(seed ^ key);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };
        let draw = self.draw(rng, width, height);
        apply_affine(chw, width, height, &draw)
    }

    pub fn draw(&self, rng: &mut dyn rand::RngCore, width: usize, height: usize) -> AffineDraw {
        let cfg = &self.cfg;
        let theta = symmetric(rng, cfg.rotation_range).to_radians();
        let tx = symmetric(rng, cfg.width_shift_range) * width as f32;
        let ty = symmetric(rng, cfg.height_shift_range) * height as f32;
        let (zx, zy) = if cfg.zoom_range > 0.0 {
            let lo = (1.0 - cfg.zoom_range).max(1e-3);
            let hi = 1.0 + cfg.zoom_range;
            (rng.random_range(lo..hi), rng.random_range(lo..hi))
        } else {
            (1.0, 1.0)
        };
        let flip = cfg.horizontal_flip && rng.random_range(0.0..1.0) < 0.5;
        AffineDraw {
            theta,
            tx,
            ty,
            zx,
            zy,
            flip,
        }
    }
}

fn symmetric(rng: &mut dyn rand::RngCore, range: f32) -> f32 {
    if range <= 0.0 {
        0.0
    } else {
        rng.random_range(-range..range)
    }
}

/// Resample every plane of `chw` through `draw`, mapping output pixels back to input.
pub fn apply_affine(chw: &[f32], width: usize, height: usize, draw: &AffineDraw) -> Vec<f32> {
    let plane = width * height;
    if plane == 0 {
        return chw.to_vec();
    }
    let channels = chw.len() / plane;
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = draw.theta.sin_cos();

    let mut out = vec![0.0f32; chw.len()];
    for y in 0..height {
        for x in 0..width {
            let ox = if draw.flip { width - 1 - x } else { x };
            let u = x as f32 - cx;
            let v = y as f32 - cy;
            let src_x = cos * draw.zx * u - sin * draw.zy * v + cx + draw.tx;
            let src_y = sin * draw.zx * u + cos * draw.zy * v + cy + draw.ty;
            for c in 0..channels {
                let src = &chw[c * plane..(c + 1) * plane];
                out[c * plane + y * width + ox] = sample_bilinear(src, width, height, src_x, src_y);
            }
        }
    }
    out
}

fn sample_bilinear(plane: &[f32], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let top = plane[y0 * width + x0] * (1.0 - fx) + plane[y0 * width + x1] * fx;
    let bottom = plane[y1 * width + x0] * (1.0 - fx) + plane[y1 * width + x1] * fx;
    top * (1.0 - fy) + bottom * fy
}
