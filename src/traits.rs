//! The primitive voxel trait implemented once per storable numeric kind.

use byteordered::byteorder::{BigEndian, ByteOrder, LittleEndian};
use byteordered::Endianness;

use crate::storage::StorageKind;

/// A value that can live in a voxel buffer and be moved to and from its on-disk encoding.
///
/// Integer kinds convert to `i64` losslessly, except `u64`, which goes through
/// `f64` for its wide form and loses precision above 2^53.
pub trait Voxel: Copy + Default + PartialEq + std::fmt::Debug {
    /// The storage kind this primitive backs.
    const KIND: StorageKind;

    /// Number of bytes one voxel takes in the voxel stream.
    const ENCODED_SIZE: usize;

    fn to_f64(self) -> f64;
    fn to_i64(self) -> i64;
    fn from_f64(value: f64) -> Self;
    fn from_i64(value: i64) -> Self;

    /// Decode `dst.len()` voxels from `src`, which must hold exactly `dst.len() * ENCODED_SIZE` bytes.
    fn decode_into(endianness: Endianness, src: &[u8], dst: &mut [Self]);

    /// Encode `src` into `dst`, which must hold exactly `src.len() * ENCODED_SIZE` bytes.
    fn encode_from(endianness: Endianness, src: &[Self], dst: &mut [u8]);
}

impl Voxel for i8 {
    const KIND: StorageKind = StorageKind::Int8;
    const ENCODED_SIZE: usize = 1;

    fn to_f64(self) -> f64 { self as f64 }
    fn to_i64(self) -> i64 { self as i64 }
    fn from_f64(value: f64) -> Self { value as i8 }
    fn from_i64(value: i64) -> Self { value as i8 }

    fn decode_into(_endianness: Endianness, src: &[u8], dst: &mut [Self]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s as i8;
        }
    }

    fn encode_from(_endianness: Endianness, src: &[Self], dst: &mut [u8]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s as u8;
        }
    }
}

impl Voxel for u8 {
    const KIND: StorageKind = StorageKind::UInt8;
    const ENCODED_SIZE: usize = 1;

    fn to_f64(self) -> f64 { self as f64 }
    fn to_i64(self) -> i64 { self as i64 }
    fn from_f64(value: f64) -> Self { value as u8 }
    fn from_i64(value: i64) -> Self { (value & 0xff) as u8 }

    fn decode_into(_endianness: Endianness, src: &[u8], dst: &mut [Self]) {
        dst.copy_from_slice(src);
    }

    fn encode_from(_endianness: Endianness, src: &[Self], dst: &mut [u8]) {
        dst.copy_from_slice(src);
    }
}

/// Implements `Voxel` for a multi-byte primitive in terms of the byteorder slice codecs.
macro_rules! impl_voxel {
    ($t:ty, $kind:ident, $size:expr, $read:ident, $write:ident, $from_i64:expr) => {
        impl Voxel for $t {
            const KIND: StorageKind = StorageKind::$kind;
            const ENCODED_SIZE: usize = $size;

            fn to_f64(self) -> f64 { self as f64 }
            fn to_i64(self) -> i64 { self as i64 }
            fn from_f64(value: f64) -> Self { value as $t }
            fn from_i64(value: i64) -> Self { $from_i64(value) }

            fn decode_into(endianness: Endianness, src: &[u8], dst: &mut [Self]) {
                match endianness {
                    Endianness::Little => LittleEndian::$read(src, dst),
                    Endianness::Big => BigEndian::$read(src, dst),
                }
            }

            fn encode_from(endianness: Endianness, src: &[Self], dst: &mut [u8]) {
                match endianness {
                    Endianness::Little => LittleEndian::$write(src, dst),
                    Endianness::Big => BigEndian::$write(src, dst),
                }
            }
        }
    };
}

impl_voxel!(i16, Int16, 2, read_i16_into, write_i16_into, |v: i64| v as i16);
impl_voxel!(u16, UInt16, 2, read_u16_into, write_u16_into, |v: i64| (v & 0xffff) as u16);
impl_voxel!(i32, Int32, 4, read_i32_into, write_i32_into, |v: i64| v as i32);
impl_voxel!(u32, UInt32, 4, read_u32_into, write_u32_into, |v: i64| (v & 0xffff_ffff) as u32);
impl_voxel!(i64, Int64, 8, read_i64_into, write_i64_into, |v: i64| v);
impl_voxel!(f32, Float32, 4, read_f32_into, write_f32_into, |v: i64| v as f32);
impl_voxel!(f64, Float64, 8, read_f64_into, write_f64_into, |v: i64| v as f64);

impl Voxel for u64 {
    const KIND: StorageKind = StorageKind::UInt64;
    const ENCODED_SIZE: usize = 8;

    fn to_f64(self) -> f64 { self as f64 }
    // Wraps above i64::MAX, callers wanting the magnitude use to_f64.
    fn to_i64(self) -> i64 { self as i64 }
    fn from_f64(value: f64) -> Self { value as u64 }
    fn from_i64(value: i64) -> Self { value as u64 }

    fn decode_into(endianness: Endianness, src: &[u8], dst: &mut [Self]) {
        match endianness {
            Endianness::Little => LittleEndian::read_u64_into(src, dst),
            Endianness::Big => BigEndian::read_u64_into(src, dst),
        }
    }

    fn encode_from(endianness: Endianness, src: &[Self], dst: &mut [u8]) {
        match endianness {
            Endianness::Little => LittleEndian::write_u64_into(src, dst),
            Endianness::Big => BigEndian::write_u64_into(src, dst),
        }
    }
}

/// A packed RGB voxel: `0xFF` alpha in the top byte, then red, green and blue.
///
/// On disk it is three bytes, red first, independent of the header byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb24(pub u32);

impl Rgb24 {
    pub fn new(r: u8, g: u8, b: u8) -> Rgb24 {
        Rgb24(0xff00_0000 | (r as u32) << 16 | (g as u32) << 8 | b as u32)
    }

    pub fn r(self) -> u8 { (self.0 >> 16) as u8 }
    pub fn g(self) -> u8 { (self.0 >> 8) as u8 }
    pub fn b(self) -> u8 { self.0 as u8 }
}

impl Voxel for Rgb24 {
    const KIND: StorageKind = StorageKind::Rgb24;
    const ENCODED_SIZE: usize = 3;

    fn to_f64(self) -> f64 { self.0 as f64 }
    fn to_i64(self) -> i64 { self.0 as i64 }
    fn from_f64(value: f64) -> Self { Rgb24::from_i64(value as i64) }
    fn from_i64(value: i64) -> Self { Rgb24(0xff00_0000 | (value as u32 & 0x00ff_ffff)) }

    fn decode_into(_endianness: Endianness, src: &[u8], dst: &mut [Self]) {
        for (d, s) in dst.iter_mut().zip(src.chunks_exact(3)) {
            *d = Rgb24::new(s[0], s[1], s[2]);
        }
    }

    fn encode_from(_endianness: Endianness, src: &[Self], dst: &mut [u8]) {
        for (s, d) in src.iter().zip(dst.chunks_exact_mut(3)) {
            d[0] = s.r();
            d[1] = s.g();
            d[2] = s.b();
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsigned_bit_patterns_widen_to_their_magnitude() {
        assert_eq!(255, 0xffu8.to_i64());
        assert_eq!(65535, 0xffffu16.to_i64());
        assert_eq!(4294967295, 0xffff_ffffu32.to_i64());
        assert_eq!(18446744073709551615.0, u64::MAX.to_f64());
    }

    #[test]
    fn big_endian_int16_is_decoded() {
        let mut out = [0i16; 2];
        i16::decode_into(Endianness::Big, &[0x01, 0x02, 0xff, 0xfe], &mut out);
        assert_eq!([0x0102, -2], out);
    }

    #[test]
    fn rgb_is_encoded_red_first() {
        let px = [Rgb24::new(10, 20, 30)];
        let mut bytes = [0u8; 3];
        Rgb24::encode_from(Endianness::Little, &px, &mut bytes);
        assert_eq!([10, 20, 30], bytes);
        assert_eq!(0xff0a141e, px[0].0);
    }
}
