//! Detection records and per-object detection tables.
//!
//! A [`Detection`] describes one extracted source in pixel coordinates of the
//! cutout it was found in: `x` runs along columns, `y` along rows, and pixel
//! centers sit on integer coordinates (the first pixel is at `(0, 0)`).
//!
//! Tables are plain arrays of records. Concatenating the tables of all frames
//! of a cube simply appends rows; nothing is re-indexed or deduplicated.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// One extracted source.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Pixel threshold used for the extraction (`level × err`).
    pub thresh: f32,
    /// Number of pixels in the object.
    pub npix: usize,
    /// Bounding box, inclusive.
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
    /// Barycenter along columns.
    pub x: f32,
    /// Barycenter along rows.
    pub y: f32,
    /// Second-order central moments in pixels².
    pub x2: f32,
    pub y2: f32,
    pub xy: f32,
    /// Semi-major and semi-minor axis of the moment ellipse.
    pub a: f32,
    pub b: f32,
    /// Position angle of the major axis, radians counter-clockwise from +x.
    pub theta: f32,
    /// Sum of the smoothed pixel values over the object.
    pub cflux: f32,
    /// Sum of the unsmoothed pixel values over the object.
    pub flux: f32,
    /// Peak smoothed value.
    pub cpeak: f32,
    /// Peak unsmoothed value.
    pub peak: f32,
    pub xcpeak: usize,
    pub ycpeak: usize,
    pub xpeak: usize,
    pub ypeak: usize,
}

impl Detection {
    /// A point-like detection with only position and flux filled in.
    ///
    /// Meant for custom [`Detector`](crate::Detector)s that measure nothing
    /// beyond a centroid and a flux. Shape fields are zero, `flux` and both
    /// peaks equal `cflux`, and the bounding box collapses to the pixel
    /// containing `(x, y)`.
    ///
    /// ```
    /// use cutout_extract::Detection;
    ///
    /// let d = Detection::at(24.3, 23.6, 150.0);
    /// assert_eq!((d.xpeak, d.ypeak), (24, 24));
    /// assert_eq!(d.npix, 1);
    /// ```
    pub fn at(x: f32, y: f32, cflux: f32) -> Self {
        let px = x.round().max(0.0) as usize;
        let py = y.round().max(0.0) as usize;
        Self {
            thresh: 0.0,
            npix: 1,
            xmin: px,
            xmax: px,
            ymin: py,
            ymax: py,
            x,
            y,
            x2: 0.0,
            y2: 0.0,
            xy: 0.0,
            a: 0.0,
            b: 0.0,
            theta: 0.0,
            cflux,
            flux: cflux,
            cpeak: cflux,
            peak: cflux,
            xcpeak: px,
            ycpeak: py,
            xpeak: px,
            ypeak: py,
        }
    }

    pub fn position(&self) -> Position {
        Position {
            x: self.x,
            y: self.y,
        }
    }

    pub fn flux(&self) -> Flux {
        Flux { cflux: self.cflux }
    }

    fn csv_record(&self) -> [String; 22] {
        [
            self.thresh.to_string(),
            self.npix.to_string(),
            self.xmin.to_string(),
            self.xmax.to_string(),
            self.ymin.to_string(),
            self.ymax.to_string(),
            self.x.to_string(),
            self.y.to_string(),
            self.x2.to_string(),
            self.y2.to_string(),
            self.xy.to_string(),
            self.a.to_string(),
            self.b.to_string(),
            self.theta.to_string(),
            self.cflux.to_string(),
            self.flux.to_string(),
            self.cpeak.to_string(),
            self.peak.to_string(),
            self.xcpeak.to_string(),
            self.ycpeak.to_string(),
            self.xpeak.to_string(),
            self.ypeak.to_string(),
        ]
    }
}

const CSV_HEADER: [&str; 22] = [
    "thresh", "npix", "xmin", "xmax", "ymin", "ymax", "x", "y", "x2", "y2", "xy", "a", "b",
    "theta", "cflux", "flux", "cpeak", "peak", "xcpeak", "ycpeak", "xpeak", "ypeak",
];

/// Centroid projection of a detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Flux projection of a detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Flux {
    pub cflux: f32,
}

/// Ordered rows of detections, for one frame or one whole cube.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionTable {
    rows: Vec<Detection>,
}

impl DetectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Detection] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.rows.iter()
    }

    pub fn push(&mut self, detection: Detection) {
        self.rows.push(detection);
    }

    /// Append all rows of `other` after the rows of `self`.
    pub fn append(&mut self, other: DetectionTable) {
        self.rows.extend(other.rows);
    }

    /// Rows for which `keep` returns true, in their original order.
    pub fn filter(&self, mut keep: impl FnMut(&Detection) -> bool) -> DetectionTable {
        self.rows.iter().filter(|d| keep(d)).cloned().collect()
    }

    /// The `x`, `y` columns.
    pub fn positions(&self) -> Vec<Position> {
        self.rows.iter().map(Detection::position).collect()
    }

    /// The `cflux` column.
    pub fn fluxes(&self) -> Vec<Flux> {
        self.rows.iter().map(Detection::flux).collect()
    }

    /// Write the table as CSV, one header row then one record per detection.
    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(CSV_HEADER)?;
        for d in &self.rows {
            wtr.write_record(d.csv_record())?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the table to a CSV file.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        self.to_csv_writer(file)
            .with_context(|| format!("Failed to write CSV file: {}", path.display()))
    }
}

impl FromIterator<Detection> for DetectionTable {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Detection>> for DetectionTable {
    fn from(rows: Vec<Detection>) -> Self {
        Self { rows }
    }
}

impl IntoIterator for DetectionTable {
    type Item = Detection;
    type IntoIter = std::vec::IntoIter<Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a DetectionTable {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

// ── Centering ───────────────────────────────────────────────────────────────

/// Axis-aligned box in pixel coordinates, bounds inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterRegion {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

/// Region a detection must fall in to count as the cutout's target.
///
/// The archived cutouts are centered on the target at pixel 24 (the middle
/// pixel of a 49-pixel-wide stamp), so the window spans from 0.6 px before to
/// 1.5 px past the center pixel on both axes.
pub const CUTOUT_CENTER: CenterRegion = CenterRegion {
    x_min: 23.4,
    x_max: 25.5,
    y_min: 23.4,
    y_max: 25.5,
};

impl CenterRegion {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Rows of `table` whose centroid falls inside the region.
    pub fn mask(&self, table: &DetectionTable) -> DetectionTable {
        table.filter(|d| self.contains(d.x, d.y))
    }
}
