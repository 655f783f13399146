//! Utility functions used in all other neurovol modules.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use byteordered::byteorder::{BigEndian, ByteOrder, LittleEndian};
use byteordered::Endianness;

use crate::error::Result;

/// Check whether the file extension ends with ".gz".
pub fn is_gz_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    path.as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().ends_with(".gz"))
        .unwrap_or(false)
}


/// Append `suffix` to the full file name of `base`, e.g. `sub1` + `.hdr` gives `sub1.hdr`.
pub fn path_with_suffix<P: AsRef<Path>>(base: P, suffix: &str) -> PathBuf {
    let mut name = base.as_ref().as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}


/// Interpret a fixed length, zero padded byte field as a string. Embedded '\0' chars are allowed, but not added to the returned String.
pub fn fixed_length_string(bytes: &[u8]) -> String {
    bytes.iter().filter(|b| **b != 0).map(|b| *b as char).collect()
}


/// Copy `value` into a fixed length byte field, truncating it or padding it with '\0'.
pub fn fill_fixed_length_field(field: &mut [u8], value: &str) {
    for (idx, slot) in field.iter_mut().enumerate() {
        *slot = value.as_bytes().get(idx).copied().unwrap_or(0);
    }
}


/// Read from `input` until `buf` is full or the stream ends, returning the number of bytes read.
pub fn read_up_to<S: Read>(input: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        match input.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(len)
}


/// Read an `i16` at the start of `bytes` in the given byte order.
pub fn read_i16_at(endianness: Endianness, bytes: &[u8]) -> i16 {
    match endianness {
        Endianness::Little => LittleEndian::read_i16(bytes),
        Endianness::Big => BigEndian::read_i16(bytes),
    }
}


/// Write an `i16` to the start of `bytes` in the given byte order.
pub fn write_i16_at(endianness: Endianness, bytes: &mut [u8], value: i16) {
    match endianness {
        Endianness::Little => LittleEndian::write_i16(bytes, value),
        Endianness::Big => BigEndian::write_i16(bytes, value),
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffixes_are_appended_to_the_whole_file_name() {
        assert_eq!(PathBuf::from("/tmp/brain.v2.hdr"), path_with_suffix("/tmp/brain.v2", ".hdr"));
        assert_eq!(PathBuf::from("brain.img.gz"), path_with_suffix("brain", ".img.gz"));
    }

    #[test]
    fn fixed_length_fields_are_padded_and_trimmed() {
        let mut field = [0xffu8; 8];
        fill_fixed_length_field(&mut field, "abc");
        assert_eq!([b'a', b'b', b'c', 0, 0, 0, 0, 0], field);
        assert_eq!("abc", fixed_length_string(&field));

        fill_fixed_length_field(&mut field, "a very long description");
        assert_eq!("a very l", fixed_length_string(&field));
    }

    #[test]
    fn gz_files_are_recognized() {
        assert!(is_gz_file("brain.nii.gz"));
        assert!(!is_gz_file("brain.nii"));
    }
}
