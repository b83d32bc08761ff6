//! Reader and writer for the MDA array format.
//!
//! MDA is the plain binary container used for `firings.mda` result files and
//! for raw recordings handed to MATLAB-based sorters. A file is a small
//! little-endian header followed by the array entries in column-major order:
//!
//! ```text
//! i32 dtype code | i32 bytes per entry | i32 num_dims | dims... | payload
//! ```
//!
//! A negative `num_dims` means the dimensions are stored as `i64` instead of
//! `i32`. Zero-length dimensions are allowed (an empty `firings.mda`).

use std::path::Path;

use crate::error::{DataError, Result};

/// Upper bound on the number of dimensions accepted when decoding.
const MAX_DIMS: usize = 50;

/// Element type of an MDA array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdaDtype {
    Uint8,
    Float32,
    Int16,
    Int32,
    Uint16,
    Float64,
    Uint32,
}

impl MdaDtype {
    /// The header code for this dtype.
    pub fn code(self) -> i32 {
        match self {
            Self::Uint8 => -2,
            Self::Float32 => -3,
            Self::Int16 => -4,
            Self::Int32 => -5,
            Self::Uint16 => -6,
            Self::Float64 => -7,
            Self::Uint32 => -8,
        }
    }

    /// Look up a dtype from its header code.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            -2 => Ok(Self::Uint8),
            -3 => Ok(Self::Float32),
            -4 => Ok(Self::Int16),
            -5 => Ok(Self::Int32),
            -6 => Ok(Self::Uint16),
            -7 => Ok(Self::Float64),
            -8 => Ok(Self::Uint32),
            other => Err(DataError::UnsupportedDtype(other)),
        }
    }

    /// Size in bytes of a single entry.
    pub fn size(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Float32 | Self::Int32 | Self::Uint32 => 4,
            Self::Float64 => 8,
        }
    }

    fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Uint8 => f64::from(bytes[0]),
            Self::Float32 => f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::Int16 => f64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::Int32 => f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::Uint16 => f64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            Self::Float64 => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            Self::Uint32 => f64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        }
    }

    fn encode(self, value: f64, out: &mut Vec<u8>) {
        // Integer conversions saturate at the type bounds.
        match self {
            Self::Uint8 => out.push(value.round() as u8),
            Self::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Self::Int16 => out.extend_from_slice(&(value.round() as i16).to_le_bytes()),
            Self::Int32 => out.extend_from_slice(&(value.round() as i32).to_le_bytes()),
            Self::Uint16 => out.extend_from_slice(&(value.round() as u16).to_le_bytes()),
            Self::Float64 => out.extend_from_slice(&value.to_le_bytes()),
            Self::Uint32 => out.extend_from_slice(&(value.round() as u32).to_le_bytes()),
        }
    }
}

/// An n-dimensional array held in memory as `f64`, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaArray {
    dtype: MdaDtype,
    dims: Vec<usize>,
    data: Vec<f64>,
}

impl MdaArray {
    /// Build an array, checking that `data` holds exactly one entry per cell.
    pub fn new(dtype: MdaDtype, dims: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(DataError::Shape {
                dims,
                message: format!("expected between 1 and {MAX_DIMS} dimensions"),
            });
        }
        let expected = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if expected != Some(data.len()) {
            let required = expected.map_or_else(|| "more than usize::MAX".to_string(), |n| n.to_string());
            return Err(DataError::Shape {
                dims,
                message: format!("{} entries supplied, {required} required", data.len()),
            });
        }
        Ok(Self { dtype, dims, data })
    }

    pub fn dtype(&self) -> MdaDtype {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Raw entries in column-major order.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Entry at `(row, col)` of a 2-D array.
    ///
    /// Returns `None` for out-of-range indices or when the array is not 2-D.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self.dims.as_slice() {
            [rows, cols] if row < *rows && col < *cols => self.data.get(row + col * rows).copied(),
            _ => None,
        }
    }

    /// Encode the array as MDA bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wide = self.dims.iter().any(|&d| d > i32::MAX as usize);
        let mut out = Vec::with_capacity(12 + self.dims.len() * 8 + self.data.len() * self.dtype.size());

        out.extend_from_slice(&self.dtype.code().to_le_bytes());
        out.extend_from_slice(&(self.dtype.size() as i32).to_le_bytes());
        let ndims = self.dims.len() as i32;
        if wide {
            out.extend_from_slice(&(-ndims).to_le_bytes());
            for &d in &self.dims {
                out.extend_from_slice(&(d as i64).to_le_bytes());
            }
        } else {
            out.extend_from_slice(&ndims.to_le_bytes());
            for &d in &self.dims {
                out.extend_from_slice(&(d as i32).to_le_bytes());
            }
        }

        for &value in &self.data {
            self.dtype.encode(value, &mut out);
        }
        out
    }

    /// Decode an array from MDA bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let dtype = MdaDtype::from_code(cursor.read_i32()?)?;
        let bytes_per_entry = cursor.read_i32()?;
        if bytes_per_entry != dtype.size() as i32 {
            return Err(DataError::MalformedHeader(format!(
                "dtype {dtype:?} has {} bytes per entry, header says {bytes_per_entry}",
                dtype.size()
            )));
        }

        let raw_ndims = cursor.read_i32()?;
        let ndims = raw_ndims.unsigned_abs() as usize;
        if ndims == 0 || ndims > MAX_DIMS {
            return Err(DataError::MalformedHeader(format!(
                "invalid number of dimensions {raw_ndims}"
            )));
        }

        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let d = if raw_ndims < 0 {
                cursor.read_i64()?
            } else {
                i64::from(cursor.read_i32()?)
            };
            let d = usize::try_from(d).map_err(|_| {
                DataError::MalformedHeader(format!("dimension {d} is negative or too large"))
            })?;
            dims.push(d);
        }

        let expected = dims
            .iter()
            .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                DataError::MalformedHeader(format!("dimensions {dims:?} overflow the address space"))
            })?;
        let payload = &bytes[cursor.pos..];
        if payload.len() < expected {
            return Err(DataError::Truncated {
                expected,
                actual: payload.len(),
            });
        }

        let data = payload[..expected]
            .chunks_exact(dtype.size())
            .map(|chunk| dtype.decode(chunk))
            .collect();

        Ok(Self { dtype, dims, data })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            DataError::MalformedHeader(format!(
                "header ends at byte {} but {end} bytes are needed",
                self.bytes.len()
            ))
        })?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.take::<8>().map(i64::from_le_bytes)
    }
}

/// Read an MDA file from disk.
pub fn read_mda(path: &Path) -> Result<MdaArray> {
    let bytes = std::fs::read(path).map_err(|e| DataError::io(path, e))?;
    MdaArray::from_bytes(&bytes)
}

/// Write an MDA file to disk, replacing any existing file.
pub fn write_mda(path: &Path, array: &MdaArray) -> Result<()> {
    std::fs::write(path, array.to_bytes()).map_err(|e| DataError::io(path, e))
}
