//! Sky background estimation.
//!
//! The frame is tiled into square meshes. In every mesh the pixel distribution
//! is sigma-clipped around its median and the sky level is taken as the mode
//! estimate `2.5 × median − 1.5 × mean`, falling back to the median when the
//! mesh is crowded by sources. The mesh grid is median-filtered to suppress
//! meshes dominated by a bright star, then:
//!
//! - the **global** level and RMS are the medians over all meshes, and
//! - the **map** is a bilinear interpolation between mesh centers.
//!
//! Cutouts are usually smaller than one mesh, in which case the whole frame
//! is a single (partial) mesh and the map is flat.

use ndarray::{s, Array2, ArrayView2};

use crate::Frame;

/// Parameters for background estimation.
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// Mesh size in pixels along both axes.
    /// Default: 64
    pub box_size: usize,

    /// Size of the median filter applied over the mesh grid.
    /// 1 disables filtering.
    /// Default: 3
    pub filter_size: usize,

    /// Pixels more than this many sigma from the median are clipped.
    /// Default: 3.0
    pub clip_sigma: f32,

    /// Maximum number of clipping passes per mesh.
    /// Default: 10
    pub clip_iterations: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            box_size: 64,
            filter_size: 3,
            clip_sigma: 3.0,
            clip_iterations: 10,
        }
    }
}

/// Background estimate of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Background {
    /// Median sky level over all meshes.
    pub global_back: f32,
    /// Median sky RMS over all meshes.
    pub global_rms: f32,
    /// Interpolated sky level at every pixel, same shape as the frame.
    pub map: Frame,
}

impl Background {
    /// Estimate the background of `frame`.
    pub fn estimate(frame: ArrayView2<f32>, config: &BackgroundConfig) -> Self {
        let (h, w) = frame.dim();
        if h == 0 || w == 0 {
            return Self::flat(0.0, 0.0, (h, w));
        }

        let bs = config.box_size.max(1);
        let ny = h.div_ceil(bs);
        let nx = w.div_ceil(bs);

        let mut backs = Array2::<f32>::zeros((ny, nx));
        let mut rmses = Array2::<f32>::zeros((ny, nx));
        let mut valid = Array2::<bool>::from_elem((ny, nx), false);
        for by in 0..ny {
            for bx in 0..nx {
                let y0 = by * bs;
                let x0 = bx * bs;
                let mesh = frame.slice(s![y0..(y0 + bs).min(h), x0..(x0 + bs).min(w)]);
                let vals: Vec<f32> = mesh.iter().copied().filter(|v| v.is_finite()).collect();
                if let Some((back, rms)) = mesh_statistics(vals, config) {
                    backs[[by, bx]] = back;
                    rmses[[by, bx]] = rms;
                    valid[[by, bx]] = true;
                }
            }
        }

        if !valid.iter().any(|&v| v) {
            return Self::flat(0.0, 0.0, (h, w));
        }
        fill_invalid_meshes(&mut backs, &valid);
        fill_invalid_meshes(&mut rmses, &valid);

        let backs = median_filter(&backs, config.filter_size);
        let rmses = median_filter(&rmses, config.filter_size);

        let global_back = median(backs.iter().copied().collect());
        let global_rms = median(rmses.iter().copied().collect());
        let map = interpolate_meshes(&backs, bs, (h, w));

        Self {
            global_back,
            global_rms,
            map,
        }
    }

    fn flat(back: f32, rms: f32, shape: (usize, usize)) -> Self {
        Self {
            global_back: back,
            global_rms: rms,
            map: Array2::from_elem(shape, back),
        }
    }

    /// `frame` minus the background map.
    pub fn subtract_from(&self, frame: ArrayView2<f32>) -> Frame {
        &frame - &self.map
    }
}

/// Clipped sky level and RMS of one mesh, or `None` if it has no usable pixels.
fn mesh_statistics(mut vals: Vec<f32>, config: &BackgroundConfig) -> Option<(f32, f32)> {
    if vals.is_empty() {
        return None;
    }

    for _ in 0..config.clip_iterations {
        let (_, sigma) = mean_sigma(&vals);
        if sigma < 1e-10 {
            break;
        }
        let med = median(vals.clone());
        let lo = med - config.clip_sigma * sigma;
        let hi = med + config.clip_sigma * sigma;
        let before = vals.len();
        vals.retain(|&v| v >= lo && v <= hi);
        if vals.len() == before {
            break; // converged
        }
    }
    let (mean, sigma) = mean_sigma(&vals);
    let med = median(vals);

    let back = if sigma > 0.0 && ((mean - med) / sigma).abs() < 0.3 {
        2.5 * med - 1.5 * mean
    } else {
        med
    };
    Some((back, sigma))
}

fn mean_sigma(vals: &[f32]) -> (f32, f32) {
    if vals.is_empty() {
        return (0.0, 0.0);
    }
    let n = vals.len() as f64;
    let mean = vals.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = vals.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt() as f32)
}

pub(crate) fn median(mut vals: Vec<f32>) -> f32 {
    if vals.is_empty() {
        return 0.0;
    }
    vals.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = vals.len();
    if n % 2 == 0 {
        (vals[n / 2 - 1] + vals[n / 2]) / 2.0
    } else {
        vals[n / 2]
    }
}

/// Replace meshes without usable pixels by the median of the valid ones.
fn fill_invalid_meshes(grid: &mut Array2<f32>, valid: &Array2<bool>) {
    let fill = median(
        grid.iter()
            .zip(valid.iter())
            .filter(|&(_, &ok)| ok)
            .map(|(&v, _)| v)
            .collect(),
    );
    grid.zip_mut_with(valid, |v, &ok| {
        if !ok {
            *v = fill;
        }
    });
}

/// Median filter over the mesh grid with a `size × size` window clipped at
/// the grid edges.
fn median_filter(grid: &Array2<f32>, size: usize) -> Array2<f32> {
    if size <= 1 {
        return grid.clone();
    }
    let (ny, nx) = grid.dim();
    let half = size / 2;
    Array2::from_shape_fn((ny, nx), |(y, x)| {
        let window = grid.slice(s![
            y.saturating_sub(half)..(y + half + 1).min(ny),
            x.saturating_sub(half)..(x + half + 1).min(nx)
        ]);
        median(window.iter().copied().collect())
    })
}

/// Bilinear interpolation of mesh values between mesh centers.
fn interpolate_meshes(grid: &Array2<f32>, bs: usize, (h, w): (usize, usize)) -> Frame {
    let (ny, nx) = grid.dim();
    let half_bs = bs as f32 / 2.0;

    Array2::from_shape_fn((h, w), |(y, x)| {
        // Position in mesh-center coordinates
        let bx_f = (x as f32 + 0.5 - half_bs) / bs as f32;
        let by_f = (y as f32 + 0.5 - half_bs) / bs as f32;

        let bx0 = (bx_f.floor() as isize).clamp(0, nx as isize - 1) as usize;
        let by0 = (by_f.floor() as isize).clamp(0, ny as isize - 1) as usize;
        let bx1 = (bx0 + 1).min(nx - 1);
        let by1 = (by0 + 1).min(ny - 1);

        // Past the outermost mesh centers the value is held constant
        let fx = if bx1 == bx0 { 0.0 } else { (bx_f - bx0 as f32).clamp(0.0, 1.0) };
        let fy = if by1 == by0 { 0.0 } else { (by_f - by0 as f32).clamp(0.0, 1.0) };

        grid[[by0, bx0]] * (1.0 - fx) * (1.0 - fy)
            + grid[[by0, bx1]] * fx * (1.0 - fy)
            + grid[[by1, bx0]] * (1.0 - fx) * fy
            + grid[[by1, bx1]] * fx * fy
    })
}
