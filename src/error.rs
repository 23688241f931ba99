use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading an archive or running strict detection.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// The archive file could not be opened.
    #[error("failed to open archive {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive is not a readable `.npz`, or an array in it is malformed.
    #[error("failed to read `{name}` from archive {}: {source}", path.display())]
    Npz {
        path: PathBuf,
        name: String,
        #[source]
        source: ndarray_npy::ReadNpzError,
    },

    /// A required named array is absent from the archive.
    #[error("archive {} has no array named `{name}`", path.display())]
    MissingArray { path: PathBuf, name: String },

    /// The identifier and image-cube sequences do not line up.
    #[error("archive has {identifiers} identifiers but {series} frame lists")]
    LengthMismatch { identifiers: usize, series: usize },

    /// A frame announced by the frame counts is not stored in the archive.
    #[error("archive {} is missing frame {frame} of object {object}", path.display())]
    MissingFrame {
        path: PathBuf,
        object: usize,
        frame: usize,
    },

    /// An array has a dtype or dimensionality that cannot be used.
    #[error("array `{name}` in archive {} is not {expected}", path.display())]
    UnsupportedArray {
        path: PathBuf,
        name: String,
        expected: &'static str,
    },

    /// No detection at any threshold from `start_level` down to 0.
    #[error("no source detected at any threshold from {start_level} down to 0")]
    NoDetection { start_level: u32 },
}
