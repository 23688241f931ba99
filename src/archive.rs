//! Archive of object identifiers and their cutout time series.
//!
//! An archive is a NumPy `.npz` file with the layout:
//!
//! | array                                   | shape      | content                         |
//! |-----------------------------------------|------------|---------------------------------|
//! | `ztf_ID`                                | `(N,)`     | integer or string identifiers   |
//! | `ztf_frame_counts`                      | `(N,)`     | number of frames per object     |
//! | `ztf_time_series_images/{obj}/{frame}`  | `(rows, cols)` | one cutout                  |
//!
//! Objects may have zero frames. Identifiers may use any integer width or a
//! fixed-width byte (`S`) or unicode (`U`) string dtype. Frames may be stored
//! as float64, float32, uint8, uint16, int16 or int32 and are converted to
//! `f32` on load. Both plain and compressed archives are read.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array1, Ix1, Ix2, OwnedRepr};
use ndarray_npy::{
    NpzReader, NpzWriter, ReadDataError, ReadNpyError, ReadNpzError, ReadableElement,
    WritableElement, WriteDataError,
};
use py_literal::Value as PyValue;
use tracing::info;

use crate::error::ExtractionError;
use crate::Frame;

/// Name of the identifier array.
pub const IDENTIFIERS_KEY: &str = "ztf_ID";
/// Name of the per-object frame count array.
pub const FRAME_COUNTS_KEY: &str = "ztf_frame_counts";
/// Prefix of the per-frame arrays.
pub const FRAMES_KEY: &str = "ztf_time_series_images";

/// Width, in characters, of the unicode field string identifiers are saved in.
pub const NAME_WIDTH: usize = 64;

/// Opaque per-object identifier, as stored in the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// Integer id, from any integer dtype.
    Int(i64),
    /// Object name, from a byte or unicode string dtype.
    Name(String),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Int(id) => write!(f, "{}", id),
            ObjectId::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ObjectId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Frames of one object, in time order.
pub type ImageCube = Vec<Frame>;

/// Identifiers and image cubes, index-aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Archive {
    identifiers: Vec<ObjectId>,
    series: Vec<ImageCube>,
}

fn frame_name(object: usize, frame: usize) -> String {
    format!("{FRAMES_KEY}/{object}/{frame}")
}

impl Archive {
    /// Build an archive from parallel sequences.
    pub fn new(
        identifiers: Vec<ObjectId>,
        series: Vec<ImageCube>,
    ) -> Result<Self, ExtractionError> {
        if identifiers.len() != series.len() {
            return Err(ExtractionError::LengthMismatch {
                identifiers: identifiers.len(),
                series: series.len(),
            });
        }
        Ok(Self {
            identifiers,
            series,
        })
    }

    pub fn identifiers(&self) -> &[ObjectId] {
        &self.identifiers
    }

    pub fn series(&self) -> &[ImageCube] {
        &self.series
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Total number of frames over all objects.
    pub fn num_frames(&self) -> usize {
        self.series.iter().map(Vec::len).sum()
    }

    /// Iterate over `(identifier, cube)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &ImageCube)> {
        self.identifiers.iter().zip(self.series.iter())
    }

    /// Remove every object without frames from both sequences and return the
    /// removed identifiers in their original order.
    pub(crate) fn remove_empty_cubes(&mut self) -> Vec<ObjectId> {
        let mut dropped = Vec::new();
        let mut kept_ids = Vec::with_capacity(self.identifiers.len());
        let mut kept_series = Vec::with_capacity(self.series.len());
        for (id, cube) in self.identifiers.drain(..).zip(self.series.drain(..)) {
            if cube.is_empty() {
                dropped.push(id);
            } else {
                kept_ids.push(id);
                kept_series.push(cube);
            }
        }
        self.identifiers = kept_ids;
        self.series = kept_series;
        dropped
    }

    /// Load an archive from an `.npz` file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ExtractionError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let archive = Self::read_npz(file, path)?;
        info!(
            "Loaded archive {}: {} objects, {} frames",
            path.display(),
            archive.len(),
            archive.num_frames()
        );
        Ok(archive)
    }

    fn read_npz<R: Read + Seek>(reader: R, path: &Path) -> Result<Self, ExtractionError> {
        let npz_err = |name: &str| {
            let name = name.to_string();
            move |source: ReadNpzError| ExtractionError::Npz {
                path: path.to_path_buf(),
                name,
                source,
            }
        };

        let mut npz = NpzReader::new(reader).map_err(npz_err(""))?;

        // Map names without the `.npy` suffix to the names stored in the zip
        let names: HashMap<String, String> = npz
            .names()
            .map_err(npz_err(""))?
            .into_iter()
            .map(|n| (n.strip_suffix(".npy").unwrap_or(&n).to_string(), n))
            .collect();
        let lookup = |key: &str| {
            names
                .get(key)
                .cloned()
                .ok_or_else(|| ExtractionError::MissingArray {
                    path: path.to_path_buf(),
                    name: key.to_string(),
                })
        };

        let ids_name = lookup(IDENTIFIERS_KEY)?;
        let identifiers = read_identifiers(&mut npz, &ids_name)
            .map_err(npz_err(IDENTIFIERS_KEY))?
            .ok_or_else(|| {
                unsupported(path, IDENTIFIERS_KEY, "a 1-D integer or string array")
            })?;

        let counts_name = lookup(FRAME_COUNTS_KEY)?;
        let counts = read_integers(&mut npz, &counts_name)
            .map_err(npz_err(FRAME_COUNTS_KEY))?
            .ok_or_else(|| unsupported(path, FRAME_COUNTS_KEY, "a 1-D integer array"))?;

        if identifiers.len() != counts.len() {
            return Err(ExtractionError::LengthMismatch {
                identifiers: identifiers.len(),
                series: counts.len(),
            });
        }

        let mut series = Vec::with_capacity(counts.len());
        for (object, &count) in counts.iter().enumerate() {
            let count = usize::try_from(count)
                .map_err(|_| unsupported(path, FRAME_COUNTS_KEY, "non-negative"))?;
            // Counts come from the file, so frames are only allocated as they are found
            let mut cube = ImageCube::new();
            for frame in 0..count {
                let key = frame_name(object, frame);
                let name = names
                    .get(&key)
                    .ok_or_else(|| ExtractionError::MissingFrame {
                        path: path.to_path_buf(),
                        object,
                        frame,
                    })?;
                let pixels = read_frame(&mut npz, name)
                    .map_err(npz_err(&key))?
                    .ok_or_else(|| unsupported(path, FRAMES_KEY, "a 2-D numeric array"))?;
                cube.push(pixels);
            }
            series.push(cube);
        }

        Ok(Self {
            identifiers,
            series,
        })
    }

    /// Save the archive to an `.npz` file in the layout [`load_from_file`](Self::load_from_file) reads.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create archive: {}", path.display()))?;
        let mut npz = NpzWriter::new(file);

        // Integer ids stay integers; any name turns the whole column into strings
        let int_ids: Option<Array1<i64>> = self
            .identifiers
            .iter()
            .map(|id| match id {
                ObjectId::Int(v) => Some(*v),
                ObjectId::Name(_) => None,
            })
            .collect();
        match int_ids {
            Some(ids) => npz.add_array(IDENTIFIERS_KEY, &ids)?,
            None => {
                let names: Array1<StoredName> = self
                    .identifiers
                    .iter()
                    .map(|id| StoredName(id.to_string()))
                    .collect();
                npz.add_array(IDENTIFIERS_KEY, &names)
                    .with_context(|| format!("Failed to write identifiers: {}", path.display()))?;
            }
        }
        let counts: Array1<i64> = self.series.iter().map(|c| c.len() as i64).collect();
        npz.add_array(FRAME_COUNTS_KEY, &counts)?;
        for (object, cube) in self.series.iter().enumerate() {
            for (frame, pixels) in cube.iter().enumerate() {
                npz.add_array(frame_name(object, frame), pixels)?;
            }
        }
        npz.finish()
            .with_context(|| format!("Failed to write archive: {}", path.display()))?;

        info!(
            "Saved archive {}: {} objects, {} frames",
            path.display(),
            self.len(),
            self.num_frames()
        );
        Ok(())
    }
}

fn unsupported(path: &Path, name: &str, expected: &'static str) -> ExtractionError {
    ExtractionError::UnsupportedArray {
        path: path.to_path_buf(),
        name: name.to_string(),
        expected,
    }
}

fn is_wrong_dtype(err: &ReadNpzError) -> bool {
    matches!(err, ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_)))
}

/// Read `name` as a 1-D array of `T`, `Ok(None)` if it has another dtype.
fn try_read_1d<T, R>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<Array1<T>>, ReadNpzError>
where
    T: ReadableElement,
    R: Read + Seek,
{
    match npz.by_name::<OwnedRepr<T>, Ix1>(name) {
        Ok(a) => Ok(Some(a)),
        Err(e) if is_wrong_dtype(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read `name` as a 2-D array of `T`, `Ok(None)` if it has another dtype.
fn try_read_2d<T, R>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<ndarray::Array2<T>>, ReadNpzError>
where
    T: ReadableElement,
    R: Read + Seek,
{
    match npz.by_name::<OwnedRepr<T>, Ix2>(name) {
        Ok(a) => Ok(Some(a)),
        Err(e) if is_wrong_dtype(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

type IntReader<R> = fn(&mut NpzReader<R>, &str) -> Result<Option<Vec<i64>>, ReadNpzError>;

/// Read `name` as a 1-D array of `T`, widened to `i64`.
fn widen<T, R>(npz: &mut NpzReader<R>, name: &str) -> Result<Option<Vec<i64>>, ReadNpzError>
where
    T: ReadableElement + Copy + Into<i64>,
    R: Read + Seek,
{
    Ok(try_read_1d::<T, R>(npz, name)?.map(|a| a.iter().map(|&v| v.into()).collect()))
}

/// Read a 1-D integer array of any width as `i64`.
fn read_integers<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<Vec<i64>>, ReadNpzError> {
    let readers: [IntReader<R>; 7] = [
        widen::<i64, R>,
        widen::<i32, R>,
        widen::<u32, R>,
        widen::<i16, R>,
        widen::<u16, R>,
        widen::<i8, R>,
        widen::<u8, R>,
    ];
    for read in readers {
        if let Some(values) = read(npz, name)? {
            return Ok(Some(values));
        }
    }
    if let Some(a) = try_read_1d::<u64, _>(npz, name)? {
        // Values beyond i64::MAX are not representable
        return Ok(a.iter().map(|&v| i64::try_from(v).ok()).collect());
    }
    Ok(None)
}

/// Read the identifier column, integers first, then strings.
fn read_identifiers<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<Vec<ObjectId>>, ReadNpzError> {
    if let Some(ids) = read_integers(npz, name)? {
        return Ok(Some(ids.into_iter().map(ObjectId::Int).collect()));
    }
    if let Some(names) = try_read_1d::<StoredName, _>(npz, name)? {
        return Ok(Some(names.into_iter().map(|n| ObjectId::Name(n.0)).collect()));
    }
    Ok(None)
}

// ── String identifiers ──────────────────────────────────────────────────────

/// One fixed-width NumPy string cell.
///
/// Reads `|S<n>` byte strings (UTF-8) and `<U<n>` / `>U<n>` UCS-4 strings,
/// dropping the trailing NUL padding. Writes little-endian `<U{NAME_WIDTH}`.
#[derive(Debug, Clone, PartialEq)]
struct StoredName(String);

#[derive(Debug, Clone, Copy)]
enum NameLayout {
    Bytes(usize),
    Ucs4 { width: usize, big_endian: bool },
}

impl NameLayout {
    fn parse(desc: &PyValue) -> Option<Self> {
        let PyValue::String(desc) = desc else {
            return None;
        };
        let (order, rest) = match desc.as_bytes().first()? {
            b'<' | b'>' | b'|' | b'=' => (desc.as_bytes()[0], &desc[1..]),
            _ => (b'|', desc.as_str()),
        };
        let width: usize = rest.get(1..)?.parse().ok()?;
        if width == 0 {
            return None;
        }
        match rest.as_bytes()[0] {
            b'S' | b'a' => Some(NameLayout::Bytes(width)),
            b'U' => Some(NameLayout::Ucs4 {
                width,
                big_endian: order == b'>',
            }),
            _ => None,
        }
    }

    fn cell_size(self) -> Option<usize> {
        match self {
            NameLayout::Bytes(width) => Some(width),
            NameLayout::Ucs4 { width, .. } => width.checked_mul(4),
        }
    }

    fn decode(self, cell: &[u8]) -> Result<StoredName, ReadDataError> {
        match self {
            NameLayout::Bytes(_) => {
                let end = cell.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                let text = std::str::from_utf8(&cell[..end])
                    .map_err(|e| ReadDataError::ParseData(Box::new(e)))?;
                Ok(StoredName(text.to_string()))
            }
            NameLayout::Ucs4 { big_endian, .. } => {
                let mut points: Vec<u32> = cell
                    .chunks_exact(4)
                    .map(|b| {
                        let b = [b[0], b[1], b[2], b[3]];
                        if big_endian {
                            u32::from_be_bytes(b)
                        } else {
                            u32::from_le_bytes(b)
                        }
                    })
                    .collect();
                while points.last() == Some(&0) {
                    points.pop();
                }
                points
                    .into_iter()
                    .map(|p| {
                        char::from_u32(p).ok_or_else(|| {
                            ReadDataError::ParseData(
                                format!("invalid UCS-4 code point {:#x}", p).into(),
                            )
                        })
                    })
                    .collect::<Result<String, _>>()
                    .map(StoredName)
            }
        }
    }
}

impl ReadableElement for StoredName {
    fn read_to_end_exact_vec<R: io::Read>(
        mut reader: R,
        type_desc: &PyValue,
        len: usize,
    ) -> Result<Vec<Self>, ReadDataError> {
        let layout = NameLayout::parse(type_desc)
            .ok_or_else(|| ReadDataError::WrongDescriptor(type_desc.clone()))?;
        let cell = layout
            .cell_size()
            .ok_or_else(|| ReadDataError::WrongDescriptor(type_desc.clone()))?;
        let total = cell.checked_mul(len).ok_or(ReadDataError::MissingData)?;

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        if bytes.len() < total {
            return Err(ReadDataError::MissingData);
        }
        if bytes.len() > total {
            return Err(ReadDataError::ExtraBytes(bytes.len() - total));
        }
        bytes.chunks_exact(cell).map(|c| layout.decode(c)).collect()
    }
}

impl WritableElement for StoredName {
    fn type_descriptor() -> PyValue {
        PyValue::String(format!("<U{}", NAME_WIDTH))
    }

    fn write<W: io::Write>(&self, mut writer: W) -> Result<(), WriteDataError> {
        if self.0.chars().count() > NAME_WIDTH || self.0.contains('\0') {
            return Err(WriteDataError::FormatData(
                format!("identifier `{}` does not fit in <U{}", self.0, NAME_WIDTH).into(),
            ));
        }
        for c in self.0.chars().chain(std::iter::repeat('\0')).take(NAME_WIDTH) {
            writer.write_all(&(c as u32).to_le_bytes())?;
        }
        Ok(())
    }

    fn write_slice<W: io::Write>(slice: &[Self], mut writer: W) -> Result<(), WriteDataError> {
        for name in slice {
            name.write(&mut writer)?;
        }
        Ok(())
    }
}

/// Read a 2-D frame of any supported dtype as `f32`.
///
/// Supported dtypes: float64, float32, uint8, uint16, int16, int32.
fn read_frame<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<Frame>, ReadNpzError> {
    if let Some(a) = try_read_2d::<f32, _>(npz, name)? {
        return Ok(Some(a));
    }
    if let Some(a) = try_read_2d::<f64, _>(npz, name)? {
        return Ok(Some(a.mapv(|v| v as f32)));
    }
    if let Some(a) = try_read_2d::<u16, _>(npz, name)? {
        return Ok(Some(a.mapv(|v| v as f32)));
    }
    if let Some(a) = try_read_2d::<i16, _>(npz, name)? {
        return Ok(Some(a.mapv(|v| v as f32)));
    }
    if let Some(a) = try_read_2d::<u8, _>(npz, name)? {
        return Ok(Some(a.mapv(|v| v as f32)));
    }
    if let Some(a) = try_read_2d::<i32, _>(npz, name)? {
        return Ok(Some(a.mapv(|v| v as f32)));
    }
    Ok(None)
}
