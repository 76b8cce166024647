//! Core data types: canonical axes, pixel types and typed cell buffers

use crate::error::{CacheError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use ndarray::{ArrayD, IxDyn};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of canonical axes (X, Y, Z, Channel, Time)
pub const CANONICAL_AXES: usize = 5;

/// Pixel element types supported by the remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PixelType {
    /// Unsigned 8-bit integer
    U8 = 0,
    /// Unsigned 16-bit integer
    U16 = 1,
    /// 32-bit floating point
    F32 = 2,
}

impl PixelType {
    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::F32 => 4,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Canonical axis of the remote addressing scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
    /// Channel
    C = 3,
    /// Time
    T = 4,
}

impl Axis {
    /// All axes in canonical order
    pub const ALL: [Axis; CANONICAL_AXES] = [Axis::X, Axis::Y, Axis::Z, Axis::C, Axis::T];

    /// Canonical index of this axis
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Single-letter label
    pub fn label(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::C => 'C',
            Axis::T => 'T',
        }
    }

    /// Whether this is one of the spatial axes X, Y, Z
    pub fn is_spatial(&self) -> bool {
        matches!(self, Axis::X | Axis::Y | Axis::Z)
    }
}

/// Flat typed buffer holding the pixels of a cell or region
///
/// Elements are stored with the first axis varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl PixelBuffer {
    /// Zero-filled buffer of `len` elements
    pub fn zeros(pixel_type: PixelType, len: usize) -> Self {
        match pixel_type {
            PixelType::U8 => PixelBuffer::U8(vec![0; len]),
            PixelType::U16 => PixelBuffer::U16(vec![0; len]),
            PixelType::F32 => PixelBuffer::F32(vec![0.0; len]),
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelBuffer::U8(_) => PixelType::U8,
            PixelBuffer::U16(_) => PixelType::U16,
            PixelBuffer::F32(_) => PixelType::F32,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the buffer contents in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.pixel_type().size_in_bytes()
    }

    /// Borrow the elements as a typed slice, if `T` matches the buffer type
    pub fn as_slice<T: Pixel>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Element at `index` widened to `f64`
    pub fn value_at(&self, index: usize) -> Option<f64> {
        match self {
            PixelBuffer::U8(v) => v.get(index).map(|&x| x as f64),
            PixelBuffer::U16(v) => v.get(index).map(|&x| x as f64),
            PixelBuffer::F32(v) => v.get(index).map(|&x| x as f64),
        }
    }

    /// Copy `len` elements from `src[src_offset..]` into `self[dst_offset..]`
    pub fn copy_within_from(
        &mut self,
        dst_offset: usize,
        src: &PixelBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        if dst_offset + len > self.len() || src_offset + len > src.len() {
            return Err(CacheError::InvalidArgument(format!(
                "Copy of {} elements out of range (dst {}/{}, src {}/{})",
                len,
                dst_offset,
                self.len(),
                src_offset,
                src.len()
            )));
        }
        match (self, src) {
            (PixelBuffer::U8(d), PixelBuffer::U8(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (PixelBuffer::U16(d), PixelBuffer::U16(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (PixelBuffer::F32(d), PixelBuffer::F32(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (d, s) => {
                return Err(CacheError::InvalidArgument(format!(
                    "Pixel type mismatch: {} vs {}",
                    d.pixel_type(),
                    s.pixel_type()
                )))
            }
        }
        Ok(())
    }

    /// Raw little-endian bytes of the buffer
    pub fn to_le_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size_in_bytes());
        match self {
            PixelBuffer::U8(v) => out.put_slice(v),
            PixelBuffer::U16(v) => v.iter().for_each(|&x| out.put_u16_le(x)),
            PixelBuffer::F32(v) => v.iter().for_each(|&x| out.put_f32_le(x)),
        }
        out.freeze()
    }

    /// View the buffer as an n-dimensional array over `dims` (first axis fastest)
    ///
    /// The returned array is indexed in reverse axis order, e.g. `[z, y, x]`.
    pub fn to_array<T: Pixel>(&self, dims: &[usize]) -> Result<ArrayD<T>> {
        let data = T::slice(self).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "Requested {} array from {} buffer",
                T::PIXEL_TYPE,
                self.pixel_type()
            ))
        })?;
        let shape: Vec<usize> = dims.iter().rev().copied().collect();
        ArrayD::from_shape_vec(IxDyn(&shape), data.to_vec())
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))
    }
}

/// Element types that can live in a [`PixelBuffer`]
pub trait Pixel: Zero + Copy + Send + Sync + fmt::Debug + 'static {
    const PIXEL_TYPE: PixelType;

    fn slice(buffer: &PixelBuffer) -> Option<&[Self]>;

    fn into_buffer(data: Vec<Self>) -> PixelBuffer;
}

impl Pixel for u8 {
    const PIXEL_TYPE: PixelType = PixelType::U8;

    fn slice(buffer: &PixelBuffer) -> Option<&[Self]> {
        match buffer {
            PixelBuffer::U8(v) => Some(v),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> PixelBuffer {
        PixelBuffer::U8(data)
    }
}

impl Pixel for u16 {
    const PIXEL_TYPE: PixelType = PixelType::U16;

    fn slice(buffer: &PixelBuffer) -> Option<&[Self]> {
        match buffer {
            PixelBuffer::U16(v) => Some(v),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> PixelBuffer {
        PixelBuffer::U16(data)
    }
}

impl Pixel for f32 {
    const PIXEL_TYPE: PixelType = PixelType::F32;

    fn slice(buffer: &PixelBuffer) -> Option<&[Self]> {
        match buffer {
            PixelBuffer::F32(v) => Some(v),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> PixelBuffer {
        PixelBuffer::F32(data)
    }
}

impl<T: Pixel> From<Vec<T>> for PixelBuffer {
    fn from(data: Vec<T>) -> Self {
        T::into_buffer(data)
    }
}
