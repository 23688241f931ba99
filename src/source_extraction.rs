//! Extract light sources from a single frame.
//!
//! The default [`SourceExtractor`] works in the way of SExtractor:
//! 1. Smoothing the frame with a small normalized kernel
//! 2. Marking pixels whose smoothed value exceeds `level × err`
//! 3. Labeling connected components of marked pixels
//! 4. Dropping components smaller than `min_area`
//! 5. Measuring barycenter, second moments, ellipse shape, fluxes and peaks
//!    of each remaining component
//!
//! Objects are returned in the order of their first pixel in a row-major
//! scan. There is no deblending and no cleaning pass: two sources whose
//! above-threshold pixels touch, such as a target and a close neighbour in
//! the same cutout, come back as a single row.
//!
//! # Example
//!
//! ```
//! use cutout_extract::{Detector, SourceExtractor};
//! use ndarray::Array2;
//!
//! let mut frame = Array2::<f32>::zeros((49, 49));
//! for r in 22..27 {
//!     for c in 22..27 {
//!         frame[[r, c]] = 50.0;
//!     }
//! }
//!
//! let extractor = SourceExtractor::default();
//! let table = extractor.extract(frame.view(), 3, 1.0);
//! assert_eq!(table.len(), 1);
//! assert!((table.rows()[0].x - 24.0).abs() < 1e-3);
//! ```

use std::collections::HashMap;

use ndarray::{array, Array2, ArrayView2, Zip};
use tracing::debug;

use crate::background::{Background, BackgroundConfig};
use crate::detection::{Detection, DetectionTable};
use crate::{Frame, FrameView, Matrix2};

/// Background estimation and source extraction on one frame.
///
/// This is the seam between the [`Extractor`](crate::Extractor) and the
/// actual source finder.
pub trait Detector {
    /// Estimate the sky background of `frame`.
    fn background(&self, frame: FrameView<'_>) -> Background;

    /// Extract sources brighter than `level × err`.
    ///
    /// Returns an empty table when nothing crosses the threshold.
    fn extract(&self, frame: FrameView<'_>, level: u32, err: f32) -> DetectionTable;
}

/// Configuration for source extraction.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Background estimation parameters.
    pub background: BackgroundConfig,

    /// Minimum number of pixels in an object.
    /// Default: 5
    pub min_area: usize,

    /// Smoothing kernel applied before thresholding. Normalized to unit sum
    /// when applied. `None` thresholds the frame as is.
    /// Default: 3×3 `[[1, 2, 1], [2, 4, 2], [1, 2, 1]]`
    pub filter_kernel: Option<Array2<f32>>,

    /// Whether to use 8-connectivity (true) or 4-connectivity (false) for
    /// connected component labeling.
    /// Default: true
    pub use_8_connectivity: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            background: BackgroundConfig::default(),
            min_area: 5,
            filter_kernel: Some(default_kernel()),
            use_8_connectivity: true,
        }
    }
}

/// 3×3 pyramidal smoothing kernel.
pub fn default_kernel() -> Array2<f32> {
    array![[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]]
}

/// Threshold-and-label source extractor.
#[derive(Debug, Clone, Default)]
pub struct SourceExtractor {
    pub config: ExtractionConfig,
}

impl SourceExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }
}

impl Detector for SourceExtractor {
    fn background(&self, frame: FrameView<'_>) -> Background {
        Background::estimate(frame, &self.config.background)
    }

    fn extract(&self, frame: FrameView<'_>, level: u32, err: f32) -> DetectionTable {
        let (h, w) = frame.dim();
        if h == 0 || w == 0 {
            return DetectionTable::new();
        }

        let thresh = level as f32 * err;
        let smoothed = match &self.config.filter_kernel {
            Some(kernel) => convolve(frame, kernel.view()),
            None => frame.to_owned(),
        };

        let mask = Zip::from(&frame)
            .and(&smoothed)
            .map_collect(|&v, &c| v.is_finite() && c > thresh);
        let (labels, num_labels) =
            label_connected_components(&mask, self.config.use_8_connectivity);

        let table = measure_objects(
            frame,
            smoothed.view(),
            &labels,
            num_labels,
            thresh,
            self.config.min_area,
        );
        debug!(
            "Level {} (threshold {:.4}): {} components, {} objects",
            level,
            thresh,
            num_labels,
            table.len()
        );
        table
    }
}

// ─── Internal helpers ──────────────────────────────────────────────────────

/// Convolve `frame` with `kernel`, normalizing by the weight of the in-bounds,
/// finite pixels under the kernel.
fn convolve(frame: FrameView<'_>, kernel: ArrayView2<f32>) -> Frame {
    let (h, w) = frame.dim();
    let (kh, kw) = kernel.dim();
    let (ry, rx) = ((kh / 2) as isize, (kw / 2) as isize);

    Array2::from_shape_fn((h, w), |(row, col)| {
        let mut sum = 0.0_f32;
        let mut weight = 0.0_f32;
        for ((ki, kj), &k) in kernel.indexed_iter() {
            let r = row as isize + ki as isize - ry;
            let c = col as isize + kj as isize - rx;
            if r < 0 || c < 0 || r >= h as isize || c >= w as isize {
                continue;
            }
            let v = frame[[r as usize, c as usize]];
            if v.is_finite() {
                sum += k * v;
                weight += k;
            }
        }
        if weight.abs() > f32::EPSILON {
            sum / weight
        } else {
            0.0
        }
    })
}

/// Label connected components in a binary mask using two-pass union-find.
///
/// Returns the label image (0 = background) and the number of labels. Labels
/// are numbered in row-major order of each component's first pixel.
fn label_connected_components(
    mask: &Array2<bool>,
    use_8_connectivity: bool,
) -> (Array2<u32>, usize) {
    let (h, w) = mask.dim();
    let mut labels = Array2::<u32>::zeros((h, w));
    let mut parent: Vec<u32> = Vec::new();
    let mut next_label = 1u32;

    // Find root with path compression
    fn find(parent: &mut [u32], mut x: u32) -> u32 {
        while parent[x as usize] != x {
            parent[x as usize] = parent[parent[x as usize] as usize];
            x = parent[x as usize];
        }
        x
    }

    // Union two labels
    fn union(parent: &mut [u32], a: u32, b: u32) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            // Merge higher into lower to keep labels stable
            if ra < rb {
                parent[rb as usize] = ra;
            } else {
                parent[ra as usize] = rb;
            }
        }
    }

    // Reserve index 0 as background
    parent.push(0);

    // First pass: assign provisional labels
    for row in 0..h {
        for col in 0..w {
            if !mask[[row, col]] {
                continue;
            }

            let mut neighbors = Vec::with_capacity(4);
            if col > 0 && labels[[row, col - 1]] > 0 {
                neighbors.push(labels[[row, col - 1]]);
            }
            if row > 0 && labels[[row - 1, col]] > 0 {
                neighbors.push(labels[[row - 1, col]]);
            }
            if use_8_connectivity && row > 0 {
                if col > 0 && labels[[row - 1, col - 1]] > 0 {
                    neighbors.push(labels[[row - 1, col - 1]]);
                }
                if col + 1 < w && labels[[row - 1, col + 1]] > 0 {
                    neighbors.push(labels[[row - 1, col + 1]]);
                }
            }

            match neighbors.iter().min().copied() {
                None => {
                    parent.push(next_label);
                    labels[[row, col]] = next_label;
                    next_label += 1;
                }
                Some(min_label) => {
                    labels[[row, col]] = min_label;
                    for &nl in &neighbors {
                        union(&mut parent, min_label, nl);
                    }
                }
            }
        }
    }

    // Second pass: map roots to sequential labels
    let mut root_map = HashMap::new();
    let mut seq = 1u32;
    for label in labels.iter_mut() {
        if *label > 0 {
            let root = find(&mut parent, *label);
            *label = *root_map.entry(root).or_insert_with(|| {
                let s = seq;
                seq += 1;
                s
            });
        }
    }

    (labels, (seq - 1) as usize)
}

/// Per-object accumulators.
struct ObjectAccum {
    npix: usize,
    xmin: usize,
    xmax: usize,
    ymin: usize,
    ymax: usize,
    // Moments relative to the first pixel of the object, weighted by the
    // positive pixel values and unweighted.
    ref_col: usize,
    ref_row: usize,
    sum_w: f64,
    sum_wx: f64,
    sum_wy: f64,
    sum_wxx: f64,
    sum_wyy: f64,
    sum_wxy: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    flux: f64,
    cflux: f64,
    peak: f32,
    xpeak: usize,
    ypeak: usize,
    cpeak: f32,
    xcpeak: usize,
    ycpeak: usize,
}

impl ObjectAccum {
    fn new() -> Self {
        Self {
            npix: 0,
            xmin: usize::MAX,
            xmax: 0,
            ymin: usize::MAX,
            ymax: 0,
            ref_col: 0,
            ref_row: 0,
            sum_w: 0.0,
            sum_wx: 0.0,
            sum_wy: 0.0,
            sum_wxx: 0.0,
            sum_wyy: 0.0,
            sum_wxy: 0.0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_yy: 0.0,
            sum_xy: 0.0,
            flux: 0.0,
            cflux: 0.0,
            peak: f32::NEG_INFINITY,
            xpeak: 0,
            ypeak: 0,
            cpeak: f32::NEG_INFINITY,
            xcpeak: 0,
            ycpeak: 0,
        }
    }

    fn add(&mut self, row: usize, col: usize, value: f32, smoothed: f32) {
        if self.npix == 0 {
            self.ref_col = col;
            self.ref_row = row;
        }
        let dx = col as f64 - self.ref_col as f64;
        let dy = row as f64 - self.ref_row as f64;
        let w = (value as f64).max(0.0);

        self.sum_w += w;
        self.sum_wx += dx * w;
        self.sum_wy += dy * w;
        self.sum_wxx += dx * dx * w;
        self.sum_wyy += dy * dy * w;
        self.sum_wxy += dx * dy * w;
        self.sum_x += dx;
        self.sum_y += dy;
        self.sum_xx += dx * dx;
        self.sum_yy += dy * dy;
        self.sum_xy += dx * dy;
        self.flux += value as f64;
        self.cflux += smoothed as f64;
        self.npix += 1;

        self.xmin = self.xmin.min(col);
        self.xmax = self.xmax.max(col);
        self.ymin = self.ymin.min(row);
        self.ymax = self.ymax.max(row);
        if value > self.peak {
            self.peak = value;
            self.xpeak = col;
            self.ypeak = row;
        }
        if smoothed > self.cpeak {
            self.cpeak = smoothed;
            self.xcpeak = col;
            self.ycpeak = row;
        }
    }

    fn into_detection(self, thresh: f32) -> Detection {
        // Fall back to the geometric center when the object has no positive flux
        let (sw, sx, sy, sxx, syy, sxy) = if self.sum_w > 0.0 {
            (
                self.sum_w,
                self.sum_wx,
                self.sum_wy,
                self.sum_wxx,
                self.sum_wyy,
                self.sum_wxy,
            )
        } else {
            (
                self.npix as f64,
                self.sum_x,
                self.sum_y,
                self.sum_xx,
                self.sum_yy,
                self.sum_xy,
            )
        };

        let dx_bar = sx / sw;
        let dy_bar = sy / sw;
        let x2 = (sxx / sw - dx_bar * dx_bar).max(0.0);
        let y2 = (syy / sw - dy_bar * dy_bar).max(0.0);
        let xy = sxy / sw - dx_bar * dy_bar;

        let cov = Matrix2::new(x2 as f32, xy as f32, xy as f32, y2 as f32);
        let eig = cov.symmetric_eigenvalues();
        let lambda_max = eig.max().max(0.0);
        let lambda_min = eig.min().max(0.0);
        let theta = 0.5 * (2.0 * xy).atan2(x2 - y2);

        Detection {
            thresh,
            npix: self.npix,
            xmin: self.xmin,
            xmax: self.xmax,
            ymin: self.ymin,
            ymax: self.ymax,
            x: (self.ref_col as f64 + dx_bar) as f32,
            y: (self.ref_row as f64 + dy_bar) as f32,
            x2: x2 as f32,
            y2: y2 as f32,
            xy: xy as f32,
            a: lambda_max.sqrt(),
            b: lambda_min.sqrt(),
            theta: theta as f32,
            cflux: self.cflux as f32,
            flux: self.flux as f32,
            cpeak: self.cpeak,
            peak: self.peak,
            xcpeak: self.xcpeak,
            ycpeak: self.ycpeak,
            xpeak: self.xpeak,
            ypeak: self.ypeak,
        }
    }
}

/// Measure every labeled object with at least `min_area` pixels.
fn measure_objects(
    frame: FrameView<'_>,
    smoothed: FrameView<'_>,
    labels: &Array2<u32>,
    num_labels: usize,
    thresh: f32,
    min_area: usize,
) -> DetectionTable {
    let mut accums: Vec<ObjectAccum> = (0..=num_labels).map(|_| ObjectAccum::new()).collect();

    for ((row, col), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        accums[label as usize].add(row, col, frame[[row, col]], smoothed[[row, col]]);
    }

    accums
        .into_iter()
        .skip(1) // skip label 0 (background)
        .filter(|acc| acc.npix >= min_area.max(1))
        .map(|acc| acc.into_detection(thresh))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_frame(h: usize, w: usize, bg: f32, stars: &[(f32, f32, f32)]) -> Frame {
        let sigma_px = 1.5_f32;
        Array2::from_shape_fn((h, w), |(row, col)| {
            let mut v = bg;
            for &(sx, sy, amp) in stars {
                let dx = col as f32 - sx;
                let dy = row as f32 - sy;
                v += amp * (-(dx * dx + dy * dy) / (2.0 * sigma_px * sigma_px)).exp();
            }
            v
        })
    }

    #[test]
    fn test_connected_components_4conn() {
        // 5x5 image with two separate blobs
        let mask = array![
            [false, true, true, false, false],
            [false, true, false, false, false],
            [false, false, false, false, false],
            [false, false, false, true, true],
            [false, false, false, true, false],
        ];
        let (labels, n) = label_connected_components(&mask, false);
        assert_eq!(n, 2);
        assert_eq!(labels[[0, 1]], 1);
        assert_eq!(labels[[0, 2]], 1);
        assert_eq!(labels[[1, 1]], 1);
        assert_eq!(labels[[3, 3]], 2);
        assert_eq!(labels[[3, 4]], 2);
        assert_eq!(labels[[4, 3]], 2);
    }

    #[test]
    fn test_connected_components_diagonal() {
        let mask = array![[true, false], [false, true]];
        let (_, n4) = label_connected_components(&mask, false);
        let (labels8, n8) = label_connected_components(&mask, true);
        assert_eq!(n4, 2);
        assert_eq!(n8, 1);
        assert_eq!(labels8[[0, 0]], labels8[[1, 1]]);
    }

    #[test]
    fn test_connected_components_u_shape_merges() {
        // Two arms joined at the bottom get provisional labels 1 and 2 first
        let mask = array![
            [true, false, true],
            [true, false, true],
            [true, true, true],
        ];
        let (labels, n) = label_connected_components(&mask, false);
        assert_eq!(n, 1);
        for (&l, &m) in labels.iter().zip(mask.iter()) {
            assert_eq!(l, if m { 1 } else { 0 });
        }
    }

    #[test]
    fn test_convolve_preserves_flat_frame() {
        let frame = Array2::from_elem((6, 7), 3.0_f32);
        let out = convolve(frame.view(), default_kernel().view());
        assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_single_star_centroid_and_shape() {
        let frame = gaussian_frame(49, 49, 0.0, &[(24.0, 24.0, 100.0)]);
        let extractor = SourceExtractor::default();
        let table = extractor.extract(frame.view(), 3, 1.0);
        assert_eq!(table.len(), 1);

        let d = &table.rows()[0];
        assert!((d.x - 24.0).abs() < 1e-3, "x = {}", d.x);
        assert!((d.y - 24.0).abs() < 1e-3, "y = {}", d.y);
        assert_eq!((d.xpeak, d.ypeak), (24, 24));
        assert!((d.peak - 100.0).abs() < 1e-3);
        assert!(d.cpeak < d.peak);
        assert!(d.flux > 0.0 && d.cflux > 0.0);
        assert!((d.a - d.b).abs() < 1e-2, "round star: a={} b={}", d.a, d.b);
        assert_eq!(d.thresh, 3.0);
        assert!(d.xmin <= 24 && d.xmax >= 24 && d.ymin <= 24 && d.ymax >= 24);
    }

    #[test]
    fn test_subpixel_centroid() {
        let frame = gaussian_frame(49, 49, 0.0, &[(24.3, 23.8, 2000.0)]);
        let config = ExtractionConfig {
            filter_kernel: None,
            ..Default::default()
        };
        let table = SourceExtractor::new(config).extract(frame.view(), 3, 1.0);
        assert_eq!(table.len(), 1);
        let d = &table.rows()[0];
        assert!((d.x - 24.3).abs() < 0.05, "x = {}", d.x);
        assert!((d.y - 23.8).abs() < 0.05, "y = {}", d.y);
    }

    #[test]
    fn test_elongated_object_orientation() {
        // Horizontal bar: major axis along x
        let mut frame = Array2::<f32>::zeros((20, 20));
        for c in 5..15 {
            frame[[10, c]] = 10.0;
            frame[[11, c]] = 10.0;
        }
        let config = ExtractionConfig {
            filter_kernel: None,
            ..Default::default()
        };
        let table = SourceExtractor::new(config).extract(frame.view(), 1, 1.0);
        assert_eq!(table.len(), 1);
        let d = &table.rows()[0];
        assert_eq!(d.npix, 20);
        assert!(d.a > 2.0 * d.b);
        assert!(d.theta.abs() < 1e-3);
        assert!((d.flux - 200.0).abs() < 1e-3);
        assert_eq!((d.xmin, d.xmax, d.ymin, d.ymax), (5, 14, 10, 11));
    }

    #[test]
    fn test_objects_in_raster_order_and_min_area() {
        let mut frame = Array2::<f32>::zeros((30, 30));
        // Lower object (3x3)
        for r in 20..23 {
            for c in 2..5 {
                frame[[r, c]] = 5.0;
            }
        }
        // Upper object (3x3)
        for r in 3..6 {
            for c in 20..23 {
                frame[[r, c]] = 9.0;
            }
        }
        // Hot pixel, below min_area
        frame[[12, 12]] = 50.0;

        let config = ExtractionConfig {
            filter_kernel: None,
            ..Default::default()
        };
        let table = SourceExtractor::new(config).extract(frame.view(), 1, 1.0);
        assert_eq!(table.len(), 2);
        assert!((table.rows()[0].x - 21.0).abs() < 1e-4);
        assert!((table.rows()[0].y - 4.0).abs() < 1e-4);
        assert!((table.rows()[1].x - 3.0).abs() < 1e-4);
        assert!((table.rows()[1].y - 21.0).abs() < 1e-4);
    }

    #[test]
    fn test_touching_sources_come_back_as_one_row() {
        // Target and a neighbour 4 px away overlap above threshold
        let frame = gaussian_frame(49, 49, 0.0, &[(24.0, 24.0, 100.0), (28.0, 24.0, 60.0)]);
        let table = SourceExtractor::default().extract(frame.view(), 3, 1.0);
        assert_eq!(table.len(), 1);
        let d = &table.rows()[0];
        assert!(d.x > 24.0 && d.x < 28.0, "x = {}", d.x);
        assert_eq!((d.xpeak, d.ypeak), (24, 24));
    }

    #[test]
    fn test_nothing_above_threshold() {
        let frame = Array2::<f32>::zeros((20, 20));
        let extractor = SourceExtractor::default();
        for level in 0..=3 {
            assert!(extractor.extract(frame.view(), level, 1.0).is_empty());
        }
    }

    #[test]
    fn test_non_finite_pixels_never_detected() {
        let mut frame = Array2::<f32>::zeros((10, 10));
        for r in 2..5 {
            for c in 2..5 {
                frame[[r, c]] = f32::NAN;
            }
        }
        let config = ExtractionConfig {
            filter_kernel: None,
            ..Default::default()
        };
        let table = SourceExtractor::new(config).extract(frame.view(), 0, 1.0);
        assert!(table.is_empty());
    }
}
