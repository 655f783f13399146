//! Typed voxel storage: the datatype table and the flat buffers backing a volume.
//!
//! Each buffer variant holds exactly one primitive kind. Voxels are decoded from
//! and encoded to byte streams in fixed-size chunks, so peak memory stays at one
//! chunk plus the typed buffer.

use byteordered::Endianness;
use log::debug;

use std::fmt;
use std::io::{Read, Write};

use crate::error::{NeurovolError, Result};
use crate::traits::{Rgb24, Voxel};
use crate::util::read_up_to;

pub const DT_NONE: i16 = 0;
pub const DT_BINARY: i16 = 1;
pub const DT_UINT8: i16 = 2;
pub const DT_INT16: i16 = 4;
pub const DT_INT32: i16 = 8;
pub const DT_FLOAT32: i16 = 16;
pub const DT_COMPLEX64: i16 = 32;
pub const DT_FLOAT64: i16 = 64;
pub const DT_RGB24: i16 = 128;
pub const DT_ALL: i16 = 255;
pub const DT_INT8: i16 = 256;
pub const DT_UINT16: i16 = 512;
pub const DT_UINT32: i16 = 768;
pub const DT_INT64: i16 = 1024;
pub const DT_UINT64: i16 = 1280;
pub const DT_FLOAT128: i16 = 1536;
pub const DT_COMPLEX128: i16 = 1792;
pub const DT_COMPLEX256: i16 = 2048;

/// Default size of the transfer buffer used for voxel streams.
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

/// Bits per voxel for every datatype code the format defines, including the
/// ones without a storage variant. `None` for codes outside the table.
pub fn bitpix_for_datatype(datatype: i16) -> Option<i16> {
    match datatype {
        DT_NONE => Some(0),
        DT_BINARY => Some(1),
        DT_UINT8 | DT_INT8 => Some(8),
        DT_INT16 | DT_UINT16 => Some(16),
        DT_INT32 | DT_FLOAT32 | DT_UINT32 => Some(32),
        DT_COMPLEX64 | DT_FLOAT64 | DT_INT64 | DT_UINT64 => Some(64),
        DT_RGB24 => Some(24),
        DT_FLOAT128 | DT_COMPLEX128 => Some(128),
        DT_COMPLEX256 => Some(256),
        _ => None,
    }
}

/// Human readable name of a datatype code.
pub fn datatype_name(datatype: i16) -> &'static str {
    match datatype {
        DT_NONE => "none",
        DT_BINARY => "binary",
        DT_UINT8 => "unsigned byte",
        DT_INT16 => "short",
        DT_INT32 => "integer",
        DT_FLOAT32 => "single",
        DT_COMPLEX64 => "complex float",
        DT_FLOAT64 => "double",
        DT_RGB24 => "rgb",
        DT_ALL => "all",
        DT_INT8 => "byte",
        DT_UINT16 => "unsigned short",
        DT_UINT32 => "unsigned integer",
        DT_INT64 => "long",
        DT_UINT64 => "unsigned long",
        DT_FLOAT128 => "long double",
        DT_COMPLEX128 => "complex double",
        DT_COMPLEX256 => "complex long double",
        _ => "unknown",
    }
}

/// The primitive kinds a volume can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Rgb24,
}

impl StorageKind {
    /// Map a header datatype code onto a storage kind.
    pub fn from_datatype(datatype: i16) -> Result<StorageKind> {
        match datatype {
            DT_INT8 => Ok(StorageKind::Int8),
            DT_UINT8 => Ok(StorageKind::UInt8),
            DT_INT16 => Ok(StorageKind::Int16),
            DT_UINT16 => Ok(StorageKind::UInt16),
            DT_INT32 => Ok(StorageKind::Int32),
            DT_UINT32 => Ok(StorageKind::UInt32),
            DT_INT64 => Ok(StorageKind::Int64),
            DT_UINT64 => Ok(StorageKind::UInt64),
            DT_FLOAT32 => Ok(StorageKind::Float32),
            DT_FLOAT64 => Ok(StorageKind::Float64),
            DT_RGB24 => Ok(StorageKind::Rgb24),
            other => Err(NeurovolError::UnsupportedDatatype(other)),
        }
    }

    pub fn datatype(self) -> i16 {
        match self {
            StorageKind::Int8 => DT_INT8,
            StorageKind::UInt8 => DT_UINT8,
            StorageKind::Int16 => DT_INT16,
            StorageKind::UInt16 => DT_UINT16,
            StorageKind::Int32 => DT_INT32,
            StorageKind::UInt32 => DT_UINT32,
            StorageKind::Int64 => DT_INT64,
            StorageKind::UInt64 => DT_UINT64,
            StorageKind::Float32 => DT_FLOAT32,
            StorageKind::Float64 => DT_FLOAT64,
            StorageKind::Rgb24 => DT_RGB24,
        }
    }

    pub fn bits_per_voxel(self) -> i16 {
        bitpix_for_datatype(self.datatype()).unwrap_or(0)
    }

    /// Bytes one voxel occupies in the voxel stream.
    pub fn encoded_size(self) -> usize {
        match self {
            StorageKind::Int8 | StorageKind::UInt8 => 1,
            StorageKind::Int16 | StorageKind::UInt16 => 2,
            StorageKind::Rgb24 => 3,
            StorageKind::Int32 | StorageKind::UInt32 | StorageKind::Float32 => 4,
            StorageKind::Int64 | StorageKind::UInt64 | StorageKind::Float64 => 8,
        }
    }

    /// The kind used for arithmetic on values of this kind. Unsigned kinds widen
    /// to the next signed kind that holds every value, `u64` widens to `f64`.
    pub fn natural(self) -> StorageKind {
        match self {
            StorageKind::UInt8 => StorageKind::Int16,
            StorageKind::UInt16 => StorageKind::Int32,
            StorageKind::UInt32 => StorageKind::Int64,
            StorageKind::UInt64 => StorageKind::Float64,
            other => other,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, StorageKind::Float32 | StorageKind::Float64)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", datatype_name(self.datatype()))
    }
}


/// A flat voxel buffer of one primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelBuffer {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Rgb24(Vec<Rgb24>),
}

/// Run `$body` with `$v` bound to the inner vector of any buffer variant.
macro_rules! with_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            VoxelBuffer::Int8($v) => $body,
            VoxelBuffer::UInt8($v) => $body,
            VoxelBuffer::Int16($v) => $body,
            VoxelBuffer::UInt16($v) => $body,
            VoxelBuffer::Int32($v) => $body,
            VoxelBuffer::UInt32($v) => $body,
            VoxelBuffer::Int64($v) => $body,
            VoxelBuffer::UInt64($v) => $body,
            VoxelBuffer::Float32($v) => $body,
            VoxelBuffer::Float64($v) => $body,
            VoxelBuffer::Rgb24($v) => $body,
        }
    };
}

impl VoxelBuffer {
    /// A zero-filled buffer of `len` voxels.
    pub fn zeros(kind: StorageKind, len: usize) -> VoxelBuffer {
        match kind {
            StorageKind::Int8 => VoxelBuffer::Int8(vec![0; len]),
            StorageKind::UInt8 => VoxelBuffer::UInt8(vec![0; len]),
            StorageKind::Int16 => VoxelBuffer::Int16(vec![0; len]),
            StorageKind::UInt16 => VoxelBuffer::UInt16(vec![0; len]),
            StorageKind::Int32 => VoxelBuffer::Int32(vec![0; len]),
            StorageKind::UInt32 => VoxelBuffer::UInt32(vec![0; len]),
            StorageKind::Int64 => VoxelBuffer::Int64(vec![0; len]),
            StorageKind::UInt64 => VoxelBuffer::UInt64(vec![0; len]),
            StorageKind::Float32 => VoxelBuffer::Float32(vec![0.; len]),
            StorageKind::Float64 => VoxelBuffer::Float64(vec![0.; len]),
            StorageKind::Rgb24 => VoxelBuffer::Rgb24(vec![Rgb24::default(); len]),
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            VoxelBuffer::Int8(_) => StorageKind::Int8,
            VoxelBuffer::UInt8(_) => StorageKind::UInt8,
            VoxelBuffer::Int16(_) => StorageKind::Int16,
            VoxelBuffer::UInt16(_) => StorageKind::UInt16,
            VoxelBuffer::Int32(_) => StorageKind::Int32,
            VoxelBuffer::UInt32(_) => StorageKind::UInt32,
            VoxelBuffer::Int64(_) => StorageKind::Int64,
            VoxelBuffer::UInt64(_) => StorageKind::UInt64,
            VoxelBuffer::Float32(_) => StorageKind::Float32,
            VoxelBuffer::Float64(_) => StorageKind::Float64,
            VoxelBuffer::Rgb24(_) => StorageKind::Rgb24,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw value at `index`, widened to `f64`.
    ///
    /// # Panics
    ///
    /// If `index` is not below `len()`.
    pub fn get_f64(&self, index: usize) -> f64 {
        with_buffer!(self, v => v[index].to_f64())
    }

    /// The raw value at `index`, widened to `i64`. Floating kinds truncate.
    ///
    /// # Panics
    ///
    /// If `index` is not below `len()`.
    pub fn get_i64(&self, index: usize) -> i64 {
        with_buffer!(self, v => v[index].to_i64())
    }

    pub fn set_f64(&mut self, index: usize, value: f64) {
        with_buffer!(self, v => v[index] = Voxel::from_f64(value))
    }

    pub fn set_i64(&mut self, index: usize, value: i64) {
        with_buffer!(self, v => v[index] = Voxel::from_i64(value))
    }

    /// Decode `count` voxels of `kind` from `input`, reading at most `chunk_bytes` at a time.
    pub fn read_from<R: Read>(
        input: &mut R,
        kind: StorageKind,
        count: usize,
        endianness: Endianness,
        chunk_bytes: usize,
    ) -> Result<VoxelBuffer> {
        debug!("Decoding {} voxels of kind {} in chunks of {} bytes.", count, kind, chunk_bytes);
        let buffer = match kind {
            StorageKind::Int8 => VoxelBuffer::Int8(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::UInt8 => VoxelBuffer::UInt8(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Int16 => VoxelBuffer::Int16(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::UInt16 => VoxelBuffer::UInt16(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Int32 => VoxelBuffer::Int32(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::UInt32 => VoxelBuffer::UInt32(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Int64 => VoxelBuffer::Int64(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::UInt64 => VoxelBuffer::UInt64(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Float32 => VoxelBuffer::Float32(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Float64 => VoxelBuffer::Float64(read_voxels(input, count, endianness, chunk_bytes)?),
            StorageKind::Rgb24 => VoxelBuffer::Rgb24(read_voxels(input, count, endianness, chunk_bytes)?),
        };
        Ok(buffer)
    }

    /// Encode all voxels to `output`, writing at most `chunk_bytes` at a time.
    pub fn write_to<W: Write>(&self, output: &mut W, endianness: Endianness, chunk_bytes: usize) -> Result<()> {
        with_buffer!(self, v => write_voxels(output, v, endianness, chunk_bytes))
    }
}

/// Number of whole voxels that fit into one transfer chunk, at least one.
fn voxels_per_chunk<T: Voxel>(chunk_bytes: usize) -> usize {
    (chunk_bytes / T::ENCODED_SIZE).max(1)
}

fn read_voxels<T: Voxel, R: Read>(input: &mut R, count: usize, endianness: Endianness, chunk_bytes: usize) -> Result<Vec<T>> {
    let per_chunk = voxels_per_chunk::<T>(chunk_bytes);
    // The buffer grows with the decoded voxels, never ahead of the stream.
    let mut data: Vec<T> = Vec::with_capacity(per_chunk.min(count));
    let mut bytes = vec![0u8; per_chunk.min(count.max(1)) * T::ENCODED_SIZE];

    while data.len() < count {
        let done = data.len();
        let n = per_chunk.min(count - done);
        let want = n * T::ENCODED_SIZE;
        let got = read_up_to(input, &mut bytes[..want])?;
        let whole = got / T::ENCODED_SIZE;
        data.resize(done + whole, T::default());
        T::decode_into(endianness, &bytes[..whole * T::ENCODED_SIZE], &mut data[done..]);
        if got < want {
            return Err(NeurovolError::TruncatedImage(count, data.len()));
        }
    }
    Ok(data)
}

fn write_voxels<T: Voxel, W: Write>(output: &mut W, data: &[T], endianness: Endianness, chunk_bytes: usize) -> Result<()> {
    let per_chunk = voxels_per_chunk::<T>(chunk_bytes);
    let mut bytes = vec![0u8; per_chunk.min(data.len().max(1)) * T::ENCODED_SIZE];
    for chunk in data.chunks(per_chunk) {
        let len = chunk.len() * T::ENCODED_SIZE;
        T::encode_from(endianness, chunk, &mut bytes[..len]);
        output.write_all(&bytes[..len])?;
    }
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn datatype_codes_map_to_one_kind_and_bitpix() {
        for kind in [
            StorageKind::Int8, StorageKind::UInt8, StorageKind::Int16, StorageKind::UInt16,
            StorageKind::Int32, StorageKind::UInt32, StorageKind::Int64, StorageKind::UInt64,
            StorageKind::Float32, StorageKind::Float64, StorageKind::Rgb24,
        ].iter() {
            assert_eq!(*kind, StorageKind::from_datatype(kind.datatype()).unwrap());
        }
        assert_eq!(24, StorageKind::Rgb24.bits_per_voxel());
        assert_eq!(Some(128), bitpix_for_datatype(DT_COMPLEX128));
        assert_eq!(None, bitpix_for_datatype(9999));
    }

    #[test]
    fn complex_and_unknown_datatypes_have_no_storage() {
        assert!(matches!(StorageKind::from_datatype(DT_COMPLEX64), Err(NeurovolError::UnsupportedDatatype(32))));
        assert!(matches!(StorageKind::from_datatype(9999), Err(NeurovolError::UnsupportedDatatype(9999))));
    }

    #[test]
    fn unsigned_cells_report_their_unsigned_value() {
        let mut u8buf = VoxelBuffer::zeros(StorageKind::UInt8, 1);
        u8buf.set_i64(0, 0xff);
        assert_eq!(255, u8buf.get_i64(0));
        assert_eq!(255.0, u8buf.get_f64(0));

        let mut u32buf = VoxelBuffer::zeros(StorageKind::UInt32, 1);
        u32buf.set_i64(0, 0xffff_ffff);
        assert_eq!(4294967295, u32buf.get_i64(0));
    }

    #[test]
    fn voxels_survive_chunked_streaming() {
        let values: Vec<i16> = (0..1000).map(|v| v as i16 - 500).collect();
        let buffer = VoxelBuffer::Int16(values);
        let mut bytes: Vec<u8> = Vec::new();
        buffer.write_to(&mut bytes, Endianness::Big, 7).unwrap();
        assert_eq!(2000, bytes.len());

        let decoded = VoxelBuffer::read_from(&mut Cursor::new(bytes), StorageKind::Int16, 1000, Endianness::Big, 7).unwrap();
        assert_eq!(buffer, decoded);
    }

    #[test]
    fn short_voxel_stream_is_reported() {
        let bytes = vec![0u8; 10];
        let res = VoxelBuffer::read_from(&mut Cursor::new(bytes), StorageKind::Float32, 4, Endianness::Little, 64);
        assert!(matches!(res, Err(NeurovolError::TruncatedImage(4, 2))));
    }

    #[test]
    fn claimed_count_does_not_allocate_ahead_of_the_stream() {
        let bytes = vec![0u8; 10];
        let res = VoxelBuffer::read_from(&mut Cursor::new(bytes), StorageKind::Int16, 1 << 40, Endianness::Little, 1 << 20);
        assert!(matches!(res, Err(NeurovolError::TruncatedImage(count, 5)) if count == 1 << 40));
    }
}
