//! Per-object source tables from an archive of cutout time series.
//!
//! The [`Extractor`] owns an [`Archive`] and a [`Detector`]. For every frame
//! it estimates the background, then searches for sources with a decreasing
//! significance level: starting at `start_level` (3 by default), the level is
//! lowered one step at a time, down to and including 0, until the detector
//! returns at least one object. Tables of all frames of a cube are appended
//! into one table per object.
//!
//! # Example
//!
//! ```no_run
//! use cutout_extract::{Extractor, ExtractorConfig, ExtractionConfig};
//!
//! let config = ExtractorConfig {
//!     subtract_background: true,
//!     ..Default::default()
//! };
//! let mut extractor =
//!     Extractor::load_with_config("data/cutouts.npz", config, ExtractionConfig::default())
//!         .unwrap();
//!
//! let selection = extractor.select();
//! for (id, rms) in extractor.identifiers().iter().zip(&selection.backgrounds) {
//!     println!("{id}: {} frames", rms.len());
//! }
//! let fluxes = extractor.take_flux();
//! ```

use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive::{Archive, ObjectId};
use crate::background::Background;
use crate::detection::{DetectionTable, Flux, Position, CUTOUT_CENTER};
use crate::error::ExtractionError;
use crate::source_extraction::{Detector, ExtractionConfig, SourceExtractor};
use crate::{Frame, FrameView};

/// Parameters of the adaptive-threshold search.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Significance level the search starts from, in units of the global
    /// background RMS.
    /// Default: 3
    pub start_level: u32,

    /// Subtract the background map from each frame before extraction.
    /// When false, the frame is thresholded as stored and only the global
    /// RMS enters the threshold.
    /// Default: false
    pub subtract_background: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            start_level: 3,
            subtract_background: false,
        }
    }
}

/// Output of [`Extractor::select`], index-aligned with the identifiers that
/// survived the selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// One table per object, rows of all frames in frame order.
    pub tables: Vec<DetectionTable>,
    /// Global background RMS of every frame, one sequence per object.
    pub backgrounds: Vec<Vec<f32>>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Source extraction over every cube of an archive.
pub struct Extractor<D = SourceExtractor> {
    archive: Archive,
    detector: D,
    config: ExtractorConfig,
}

impl Extractor<SourceExtractor> {
    /// Load an archive and use the default extractor settings.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ExtractionError> {
        Self::load_with_config(path, ExtractorConfig::default(), ExtractionConfig::default())
    }

    /// Load an archive with explicit search and extraction settings.
    pub fn load_with_config(
        path: impl AsRef<Path>,
        config: ExtractorConfig,
        extraction: ExtractionConfig,
    ) -> Result<Self, ExtractionError> {
        let archive = Archive::load_from_file(path)?;
        Ok(Self::new(archive, SourceExtractor::new(extraction), config))
    }
}

impl<D: Detector> Extractor<D> {
    pub fn new(archive: Archive, detector: D, config: ExtractorConfig) -> Self {
        Self {
            archive,
            detector,
            config,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Identifiers of the objects currently held, aligned with the output of
    /// [`select`](Self::select).
    pub fn identifiers(&self) -> &[ObjectId] {
        self.archive.identifiers()
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Detect sources in `frame`, lowering the level from `start_level` to 0
    /// until something is found.
    ///
    /// Returns the first non-empty table together with the background used.
    /// If no level yields a detection, the table is empty.
    pub fn detect_sources(
        &self,
        frame: FrameView<'_>,
        start_level: u32,
    ) -> (DetectionTable, Background) {
        let (_, table, background) = self.search(frame, start_level);
        (table, background)
    }

    /// Like [`detect_sources`](Self::detect_sources), but fails with
    /// [`ExtractionError::NoDetection`] when no level yields a detection.
    pub fn try_detect_sources(
        &self,
        frame: FrameView<'_>,
        start_level: u32,
    ) -> Result<(DetectionTable, Background), ExtractionError> {
        match self.search(frame, start_level) {
            (Some(_), table, background) => Ok((table, background)),
            (None, _, _) => Err(ExtractionError::NoDetection { start_level }),
        }
    }

    /// Adaptive-threshold search. Also returns the level that succeeded.
    fn search(
        &self,
        frame: FrameView<'_>,
        start_level: u32,
    ) -> (Option<u32>, DetectionTable, Background) {
        let background = self.detector.background(frame);
        let err = background.global_rms;

        let subtracted: Frame;
        let data = if self.config.subtract_background {
            subtracted = background.subtract_from(frame);
            subtracted.view()
        } else {
            frame.view()
        };

        for level in (0..=start_level).rev() {
            let table = self.detector.extract(data, level, err);
            if !table.is_empty() {
                if level < start_level {
                    debug!(
                        "Found {} sources after lowering level from {} to {}",
                        table.len(),
                        start_level,
                        level
                    );
                }
                return (Some(level), table, background);
            }
        }

        debug!(
            "No sources at any level from {} down to 0 (rms {:.4})",
            start_level, err
        );
        (None, DetectionTable::new(), background)
    }

    /// Detect sources in every frame of `cube` and append the tables.
    ///
    /// Returns the concatenated table and the global background RMS of each
    /// frame, in frame order. Frames without detections contribute no rows
    /// but still contribute their RMS.
    pub fn build_cube_table(&self, cube: &[Frame]) -> (DetectionTable, Vec<f32>) {
        let mut table = DetectionTable::new();
        let mut rms = Vec::with_capacity(cube.len());
        for frame in cube {
            let (frame_table, background) =
                self.detect_sources(frame.view(), self.config.start_level);
            table.append(frame_table);
            rms.push(background.global_rms);
        }
        (table, rms)
    }

    /// Build one table per object.
    ///
    /// Objects without frames are removed from the archive (identifier and
    /// cube) with a warning, so the output stays aligned with
    /// [`identifiers`](Self::identifiers).
    pub fn select(&mut self) -> Selection {
        for id in self.archive.remove_empty_cubes() {
            warn!("{} was empty", id);
        }

        let mut selection = Selection::default();
        for (id, cube) in self.archive.iter() {
            let (table, rms) = self.build_cube_table(cube);
            debug!("Object {}: {} frames, {} detections", id, cube.len(), table.len());
            selection.tables.push(table);
            selection.backgrounds.push(rms);
        }

        info!(
            "Selected {} objects, {} detections",
            selection.len(),
            selection.tables.iter().map(DetectionTable::len).sum::<usize>()
        );
        selection
    }

    /// Rows of `table` inside [`CUTOUT_CENTER`].
    pub fn mask_center(&self, table: &DetectionTable) -> DetectionTable {
        CUTOUT_CENTER.mask(table)
    }

    /// Centered detections of every object.
    pub fn take_center(&mut self) -> Vec<DetectionTable> {
        let selection = self.select();
        selection
            .tables
            .iter()
            .map(|table| self.mask_center(table))
            .collect()
    }

    /// Centered `(x, y)` positions of every object.
    pub fn take_position(&mut self) -> Vec<Vec<Position>> {
        self.take_center()
            .iter()
            .map(DetectionTable::positions)
            .collect()
    }

    /// Centered `cflux` values of every object.
    pub fn take_flux(&mut self) -> Vec<Vec<Flux>> {
        self.take_center()
            .iter()
            .map(DetectionTable::fluxes)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use ndarray::Array2;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Detector that answers from a script keyed by the value of pixel (0, 0).
    ///
    /// A frame tagged `t` yields `hits[t].1` at every level up to
    /// `hits[t].0` and nothing above it. Untagged frames yield nothing.
    struct ScriptedDetector {
        hits: HashMap<i32, (u32, Vec<Detection>)>,
        rms: f32,
        levels_tried: RefCell<Vec<u32>>,
    }

    impl ScriptedDetector {
        fn new(rms: f32) -> Self {
            Self {
                hits: HashMap::new(),
                rms,
                levels_tried: RefCell::new(Vec::new()),
            }
        }

        fn with_hit(mut self, tag: i32, max_level: u32, rows: Vec<Detection>) -> Self {
            self.hits.insert(tag, (max_level, rows));
            self
        }
    }

    impl Detector for ScriptedDetector {
        fn background(&self, frame: FrameView<'_>) -> Background {
            Background {
                global_back: 0.0,
                global_rms: self.rms,
                map: Array2::zeros(frame.dim()),
            }
        }

        fn extract(&self, frame: FrameView<'_>, level: u32, err: f32) -> DetectionTable {
            assert_eq!(err, self.rms);
            self.levels_tried.borrow_mut().push(level);
            let tag = frame[[0, 0]] as i32;
            match self.hits.get(&tag) {
                Some((max_level, rows)) if level <= *max_level => rows.clone().into(),
                _ => DetectionTable::new(),
            }
        }
    }

    fn tagged(tag: i32) -> Frame {
        let mut frame = Array2::<f32>::zeros((49, 49));
        frame[[0, 0]] = tag as f32;
        frame
    }

    fn extractor(detector: ScriptedDetector) -> Extractor<ScriptedDetector> {
        Extractor::new(Archive::default(), detector, ExtractorConfig::default())
    }

    #[test]
    fn test_first_level_hit_stops_search() {
        let rows = vec![Detection::at(24.0, 24.0, 100.0)];
        let ex = extractor(ScriptedDetector::new(2.0).with_hit(1, 3, rows.clone()));

        let (table, bkg) = ex.detect_sources(tagged(1).view(), 3);
        assert_eq!(table, DetectionTable::from(rows.clone()));
        assert_eq!(bkg.global_rms, 2.0);
        assert_eq!(*ex.detector().levels_tried.borrow(), vec![3]);

        // Same input, same output
        let (again, _) = ex.detect_sources(tagged(1).view(), 3);
        assert_eq!(again, table);
    }

    #[test]
    fn test_late_success_at_level_zero() {
        let rows = vec![Detection::at(10.0, 11.0, 5.0), Detection::at(24.0, 24.0, 7.0)];
        let ex = extractor(ScriptedDetector::new(1.0).with_hit(2, 0, rows.clone()));

        let (table, _) = ex.detect_sources(tagged(2).view(), 3);
        assert_eq!(table, DetectionTable::from(rows));
        assert_eq!(*ex.detector().levels_tried.borrow(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_all_levels_empty() {
        let ex = extractor(ScriptedDetector::new(1.5));

        let (table, bkg) = ex.detect_sources(tagged(9).view(), 3);
        assert!(table.is_empty());
        assert_eq!(bkg.global_rms, 1.5);
        assert_eq!(*ex.detector().levels_tried.borrow(), vec![3, 2, 1, 0]);

        let err = ex.try_detect_sources(tagged(9).view(), 3).unwrap_err();
        assert!(matches!(err, ExtractionError::NoDetection { start_level: 3 }));
    }

    #[test]
    fn test_strict_variant_late_success() {
        let rows = vec![Detection::at(24.0, 24.0, 1.0)];
        let ex = extractor(ScriptedDetector::new(1.0).with_hit(4, 1, rows.clone()));
        let (table, _) = ex.try_detect_sources(tagged(4).view(), 3).unwrap();
        assert_eq!(table, DetectionTable::from(rows));
    }

    #[test]
    fn test_custom_start_level() {
        let ex = extractor(ScriptedDetector::new(1.0));
        ex.detect_sources(tagged(0).view(), 5);
        assert_eq!(*ex.detector().levels_tried.borrow(), vec![5, 4, 3, 2, 1, 0]);

        ex.detector().levels_tried.borrow_mut().clear();
        ex.detect_sources(tagged(0).view(), 0);
        assert_eq!(*ex.detector().levels_tried.borrow(), vec![0]);
    }

    #[test]
    fn test_build_cube_table_appends_in_frame_order() {
        let detector = ScriptedDetector::new(0.5)
            .with_hit(1, 3, vec![Detection::at(1.0, 1.0, 1.0)])
            .with_hit(3, 2, vec![Detection::at(3.0, 3.0, 3.0), Detection::at(4.0, 4.0, 4.0)]);
        let ex = extractor(detector);

        let cube = vec![tagged(1), tagged(2), tagged(3)];
        let (table, rms) = ex.build_cube_table(&cube);
        assert_eq!(
            table.fluxes(),
            vec![Flux { cflux: 1.0 }, Flux { cflux: 3.0 }, Flux { cflux: 4.0 }]
        );
        assert_eq!(rms, vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_select_drops_empty_cubes() {
        let archive = Archive::new(
            vec![ObjectId::Int(100), ObjectId::Int(200), ObjectId::Int(300)],
            vec![vec![tagged(1)], vec![], vec![tagged(5), tagged(1)]],
        )
        .unwrap();
        let detector = ScriptedDetector::new(1.0).with_hit(1, 3, vec![Detection::at(24.0, 24.0, 9.0)]);
        let mut ex = Extractor::new(archive, detector, ExtractorConfig::default());

        let selection = ex.select();
        assert_eq!(ex.identifiers(), &[ObjectId::Int(100), ObjectId::Int(300)]);
        assert_eq!(ex.archive().series().len(), 2);
        assert_eq!(selection.len(), 2);
        assert_eq!(selection.tables[0].len(), 1);
        assert_eq!(selection.tables[1].len(), 1);
        assert_eq!(selection.backgrounds, vec![vec![1.0], vec![1.0, 1.0]]);

        // Selecting again gives the same result
        assert_eq!(ex.select(), selection);
    }

    #[test]
    fn test_take_center_position_flux() {
        let rows = vec![
            Detection::at(24.0, 24.0, 100.0),
            Detection::at(5.0, 24.0, 50.0),
            Detection::at(25.5, 23.4, 20.0),
        ];
        let archive = Archive::new(vec![ObjectId::Int(1)], vec![vec![tagged(1)]]).unwrap();
        let detector = ScriptedDetector::new(1.0).with_hit(1, 3, rows);
        let mut ex = Extractor::new(archive, detector, ExtractorConfig::default());

        let centered = ex.take_center();
        assert_eq!(centered.len(), 1);
        assert_eq!(centered[0].len(), 2);
        assert_eq!(ex.mask_center(&centered[0]), centered[0]);

        assert_eq!(
            ex.take_position(),
            vec![vec![Position { x: 24.0, y: 24.0 }, Position { x: 25.5, y: 23.4 }]]
        );
        assert_eq!(
            ex.take_flux(),
            vec![vec![Flux { cflux: 100.0 }, Flux { cflux: 20.0 }]]
        );
    }

    #[test]
    fn test_subtract_background_feeds_residual() {
        // Flat frame at 50 with a 3x3 bump; subtracting the map leaves only the bump
        let mut frame = Array2::from_elem((49, 49), 50.0_f32);
        for r in 23..26 {
            for c in 23..26 {
                frame[[r, c]] = 80.0;
            }
        }
        let archive = Archive::default();
        let config = ExtractorConfig {
            subtract_background: true,
            ..Default::default()
        };
        let ex = Extractor::new(archive, SourceExtractor::default(), config);
        let (table, bkg) = ex.detect_sources(frame.view(), 3);
        assert!((bkg.global_back - 50.0).abs() < 1e-3);
        assert_eq!(table.len(), 1);
        assert!((table.rows()[0].x - 24.0).abs() < 1e-3);
        assert!((table.rows()[0].y - 24.0).abs() < 1e-3);

        // Without subtraction the whole frame is above threshold
        let ex = Extractor::new(
            Archive::default(),
            SourceExtractor::default(),
            ExtractorConfig::default(),
        );
        let (table, _) = ex.detect_sources(frame.view(), 3);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].npix, 49 * 49);
    }
}
