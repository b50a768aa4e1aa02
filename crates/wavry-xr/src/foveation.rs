//! Foveated decode parameters.
//!
//! A foveated frame keeps a full resolution center region and compresses the
//! edges by `edge_ratio`. The renderer needs the inverse warp: for each display
//! position, where to sample the compressed frame. This module derives the
//! per-axis coefficients of that warp once per configuration.

use glam::{UVec2, Vec2};
use serde::Serialize;

use crate::types::FoveationConfig;

/// Encoder block alignment for the compressed eye size.
const SIZE_ALIGNMENT: f32 = 32.0;

/// Aligned foveation layout shared by encoder sizing and the warp solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoveationBase {
    /// Ideal compressed size over the 32-aligned size, in (0, 1].
    pub eye_size_ratio: Vec2,
    pub center_size: Vec2,
    pub center_shift: Vec2,
    pub edge_ratio: Vec2,
    /// Compressed eye resolution actually encoded and decoded.
    pub aligned_eye_size: UVec2,
}

/// Per-axis inverse warp coefficients consumed by the video shader.
///
/// Left edge: `(-b_left + sqrt(b_left^2 + 4 * a_left * x)) / (2 * a_left)`.
/// Right edge: `(-b_right + sqrt(b_right^2 + 4 * (c_right - a_right * x))) / (2 * a_right)`.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FoveatedDecodeParams {
    pub eye_size_ratio: Vec2,
    pub edge_ratio: Vec2,
    pub c1: Vec2,
    pub c2: Vec2,
    pub lo_bound: Vec2,
    pub hi_bound: Vec2,
    pub a_left: Vec2,
    pub b_left: Vec2,
    pub a_right: Vec2,
    pub b_right: Vec2,
    pub c_right: Vec2,
}

struct AxisBase {
    eye_size_ratio: f32,
    center_size: f32,
    center_shift: f32,
    aligned_size: u32,
}

// Alignment steps run in f64 so the ceil boundaries match the encoder side.
fn axis_base(target: f32, center_size: f32, center_shift: f32, edge_ratio: f32) -> AxisBase {
    let step = edge_ratio as f64 * 2.0;

    let edge_size = target - center_size * target;
    let center_size = (1.0 - (edge_size as f64 / step).ceil() * step / target as f64) as f32;

    let edge_size = target - center_size * target;
    let center_shift =
        (((center_shift * edge_size) as f64 / step).ceil() * step / edge_size as f64) as f32;

    let scale = center_size + (1.0 - center_size) / edge_ratio;
    let optimized = scale * target;
    let aligned_size = (optimized / SIZE_ALIGNMENT).ceil() as u32 * SIZE_ALIGNMENT as u32;

    AxisBase {
        eye_size_ratio: optimized / aligned_size as f32,
        center_size,
        center_shift,
        aligned_size,
    }
}

struct AxisWarp {
    c1: f32,
    c2: f32,
    lo_bound: f32,
    hi_bound: f32,
    a_left: f32,
    b_left: f32,
    a_right: f32,
    b_right: f32,
    c_right: f32,
}

fn axis_warp(center_size: f32, center_shift: f32, edge_ratio: f32) -> AxisWarp {
    let er = edge_ratio;
    let c0 = (1.0 - center_size) * 0.5;
    let c1 = (er - 1.0) * c0 * (center_shift + 1.0) / er;
    let c2 = (er - 1.0) * center_size + 1.0;

    // Crossovers in display space.
    let lo_bound = c0 * (center_shift + 1.0);
    let hi_bound = c0 * (center_shift - 1.0) + 1.0;

    // Same crossovers in compressed space.
    let lo_bound_c = c0 * (center_shift + 1.0) / c2;
    let hi_bound_c = c0 * (center_shift - 1.0) / c2 + 1.0;
    let hi_rem = 1.0 - hi_bound_c;

    let a_left = c2 * (1.0 - er) / (er * lo_bound_c);
    let b_left = (c1 + c2 * lo_bound_c) / lo_bound_c;

    let a_right = c2 * (er - 1.0) / (er * hi_rem);
    let b_right = (c2 - er * c1 - 2.0 * er * c2 + c2 * er * hi_rem + er) / (er * hi_rem);
    let c_right = ((c2 * er - c2) * (c1 - hi_bound_c + c2 * hi_bound_c)) / (er * hi_rem * hi_rem);

    AxisWarp {
        c1,
        c2,
        lo_bound,
        hi_bound,
        a_left,
        b_left,
        a_right,
        b_right,
        c_right,
    }
}

impl FoveationBase {
    pub fn new(target_eye_size: Vec2, config: &FoveationConfig) -> Self {
        let x = axis_base(
            target_eye_size.x,
            config.center_size.x,
            config.center_shift.x,
            config.edge_ratio.x,
        );
        let y = axis_base(
            target_eye_size.y,
            config.center_size.y,
            config.center_shift.y,
            config.edge_ratio.y,
        );
        Self {
            eye_size_ratio: Vec2::new(x.eye_size_ratio, y.eye_size_ratio),
            center_size: Vec2::new(x.center_size, y.center_size),
            center_shift: Vec2::new(x.center_shift, y.center_shift),
            edge_ratio: config.edge_ratio,
            aligned_eye_size: UVec2::new(x.aligned_size, y.aligned_size),
        }
    }
}

impl FoveatedDecodeParams {
    pub fn new(target_eye_size: Vec2, config: &FoveationConfig) -> Self {
        Self::from_base(&FoveationBase::new(target_eye_size, config))
    }

    pub fn from_base(base: &FoveationBase) -> Self {
        let x = axis_warp(base.center_size.x, base.center_shift.x, base.edge_ratio.x);
        let y = axis_warp(base.center_size.y, base.center_shift.y, base.edge_ratio.y);
        Self {
            eye_size_ratio: base.eye_size_ratio,
            edge_ratio: base.edge_ratio,
            c1: Vec2::new(x.c1, y.c1),
            c2: Vec2::new(x.c2, y.c2),
            lo_bound: Vec2::new(x.lo_bound, y.lo_bound),
            hi_bound: Vec2::new(x.hi_bound, y.hi_bound),
            a_left: Vec2::new(x.a_left, y.a_left),
            b_left: Vec2::new(x.b_left, y.b_left),
            a_right: Vec2::new(x.a_right, y.a_right),
            b_right: Vec2::new(x.b_right, y.b_right),
            c_right: Vec2::new(x.c_right, y.c_right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> FoveationConfig {
        FoveationConfig {
            center_size: Vec2::new(0.4, 0.35),
            center_shift: Vec2::new(0.4, 0.1),
            edge_ratio: Vec2::new(4.0, 5.0),
        }
    }

    #[test]
    fn test_deterministic() {
        let target = Vec2::new(1832.0, 1920.0);
        let a = FoveatedDecodeParams::new(target, &sample_config());
        let b = FoveatedDecodeParams::new(target, &sample_config());
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
        assert_eq!(a.c_right.x.to_bits(), b.c_right.x.to_bits());
        assert_eq!(a.b_left.y.to_bits(), b.b_left.y.to_bits());
    }

    #[test]
    fn test_aligned_size_is_block_multiple() {
        for (w, h) in [(1832.0, 1920.0), (1440.0, 1584.0), (2064.0, 2208.0), (1000.0, 777.0)] {
            let base = FoveationBase::new(Vec2::new(w, h), &sample_config());
            assert_eq!(base.aligned_eye_size.x % 32, 0);
            assert_eq!(base.aligned_eye_size.y % 32, 0);
            for ratio in [base.eye_size_ratio.x, base.eye_size_ratio.y] {
                assert!(ratio > 0.0 && ratio <= 1.0, "ratio {ratio} out of range");
            }
        }
    }

    #[test]
    fn test_known_layout() {
        let base = FoveationBase::new(Vec2::new(1440.0, 1584.0), &sample_config());
        // 864 edge pixels are already a multiple of 8, so the center keeps its size.
        assert!((base.center_size.x - 0.4).abs() < 1e-6);
        // 0.4 + 0.6 / 4 = 0.55 -> 792 pixels -> 800 aligned.
        assert_eq!(base.aligned_eye_size.x, 800);
        assert!((base.eye_size_ratio.x - 0.99).abs() < 1e-4);
    }

    #[test]
    fn test_edge_alignment() {
        let target = Vec2::new(1440.0, 1584.0);
        let base = FoveationBase::new(target, &sample_config());
        for (size, center, ratio) in [
            (target.x, base.center_size.x, base.edge_ratio.x),
            (target.y, base.center_size.y, base.edge_ratio.y),
        ] {
            let edge = (size - center * size) as f64;
            let steps = edge / (ratio as f64 * 2.0);
            assert!((steps - steps.round()).abs() < 1e-3, "edge {edge} not aligned");
        }
    }

    #[test]
    fn test_warp_is_continuous_at_crossovers() {
        let params = FoveatedDecodeParams::new(Vec2::new(1440.0, 1584.0), &sample_config());
        let (a, b) = (params.a_left.x, params.b_left.x);
        let left_edge = |x: f32| (-b + (b * b + 4.0 * a * x).sqrt()) / (2.0 * a);

        assert!(left_edge(0.0).abs() < 1e-6);
        // The display crossover samples the compressed crossover.
        let lo_c = params.lo_bound.x / params.c2.x;
        let at_bound = left_edge(params.lo_bound.x);
        assert!((at_bound - lo_c).abs() < 1e-3, "left edge {at_bound}, expected {lo_c}");
        assert!(params.lo_bound.x < params.hi_bound.x);
    }

    #[test]
    fn test_layout_is_16_byte_aligned() {
        assert_eq!(std::mem::align_of::<FoveatedDecodeParams>(), 16);
        assert_eq!(std::mem::size_of::<FoveatedDecodeParams>() % 16, 0);
    }
}
