//! # cutout-extract
//!
//! Source extraction for **time series of astronomical image cutouts**.
//!
//! An archive holds one integer identifier per object and, for each object, a
//! cube of small 2-D cutouts taken at different epochs. For every frame of
//! every cube, `cutout-extract` estimates the sky background, extracts light
//! sources, and collects the detections into one table per object. The tables
//! can then be restricted to sources sitting at the cutout center and
//! projected onto positions or fluxes.
//!
//! ## Example
//!
//! ```no_run
//! use cutout_extract::Extractor;
//!
//! let mut extractor = Extractor::load_from_file("data/cutouts.npz").unwrap();
//!
//! // One (x, y) list per surviving object, centered detections only
//! let positions = extractor.take_position();
//! for (id, pos) in extractor.identifiers().iter().zip(&positions) {
//!     println!("{id}: {} centered detections", pos.len());
//! }
//! ```
//!
//! ## Pipeline
//!
//! 1. **Background**: mesh-based, sigma-clipped estimate of the sky level and
//!    its global RMS
//! 2. **Extraction**: smooth, threshold at `level × rms`, label connected
//!    pixels, and measure barycenter, moments and fluxes of each object
//! 3. **Adaptive threshold**: start at 3σ and lower the level one step at a
//!    time, down to 0, until at least one source is found
//! 4. **Centering**: keep detections inside [`CUTOUT_CENTER`]
//!
//! The extraction stage sits behind the [`Detector`] trait, so a different
//! source finder can be plugged into the [`Extractor`].

pub mod archive;
pub mod background;
pub mod detection;
mod error;
pub mod extractor;
pub mod source_extraction;

pub use archive::{Archive, ImageCube, ObjectId};
pub use background::{Background, BackgroundConfig};
pub use detection::{CenterRegion, Detection, DetectionTable, Flux, Position, CUTOUT_CENTER};
pub use error::ExtractionError;
pub use extractor::{Extractor, ExtractorConfig, Selection};
pub use source_extraction::{Detector, ExtractionConfig, SourceExtractor};

// Commonly used types
// Pixels are stored as f32; moment sums are accumulated in f64.
pub type Frame = ndarray::Array2<f32>;
pub type FrameView<'a> = ndarray::ArrayView2<'a, f32>;
pub type Matrix2 = nalgebra::Matrix2<f32>;
