//! A minimal reader for MATLAB MAT files, level 4 and level 5.
//!
//! SPM stores the index-to-space matrix of an Analyze volume in a companion `.mat`
//! file. Only real numeric 2-D arrays are decoded, everything else (text, sparse,
//! cell, struct, object and complex arrays) is skipped.

use byteordered::{ByteOrdered, Endianness};
use flate2::read::ZlibDecoder;
use log::debug;
use ndarray::{Array2, ShapeBuilder};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use crate::error::{NeurovolError, Result};
use crate::util::is_gz_file;

const MAT5_HEADER_SIZE: usize = 128;

// Level 5 data element types.
const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

// Level 5 array classes with a numeric payload.
const MX_DOUBLE_CLASS: u32 = 6;
const MX_UINT64_CLASS: u32 = 15;

const MX_COMPLEX_FLAG: u32 = 0x0800;

/// The real numeric 2-D variables of a MAT file, by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatFile {
    pub variables: HashMap<String, Array2<f64>>,
}


impl MatFile {

    /// Read a MAT file. If the file's name ends with ".gz", it is inflated first.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<MatFile> {
        let gz = is_gz_file(&path);
        let mut file = BufReader::new(File::open(path)?);
        let mut bytes = Vec::new();
        if gz {
            flate2::bufread::GzDecoder::new(file).read_to_end(&mut bytes)?;
        } else {
            file.read_to_end(&mut bytes)?;
        }
        MatFile::from_bytes(&bytes)
    }


    /// Decode a MAT file held in memory. A zero byte among the first four marks level 4.
    pub fn from_bytes(bytes: &[u8]) -> Result<MatFile> {
        if bytes.len() < 4 {
            return Err(NeurovolError::InvalidMatFile(format!("file of {} bytes is too short", bytes.len())));
        }
        let variables = if bytes[..4].contains(&0) {
            read_level4(bytes)?
        } else {
            read_level5(bytes)?
        };
        debug!("Decoded {} numeric MAT variable(s).", variables.len());
        Ok(MatFile { variables })
    }


    /// The named variable, if it was present and numeric.
    pub fn matrix(&self, name: &str) -> Option<&Array2<f64>> {
        self.variables.get(name)
    }
}


fn invalid<T>(reason: &str) -> Result<T> {
    Err(NeurovolError::InvalidMatFile(reason.to_string()))
}


/// Level 4: a sequence of `(type, mrows, ncols, imagf, namlen)` headers, each followed
/// by the name and the column-major data. The thousands digit of `type` gives the byte order.
fn read_level4(bytes: &[u8]) -> Result<HashMap<String, Array2<f64>>> {
    let mut variables = HashMap::new();
    let mut pos = 0;
    while bytes.len() - pos >= 20 {
        let endianness = level4_endianness(&bytes[pos..pos + 4])?;
        let mut input = ByteOrdered::runtime(Cursor::new(&bytes[pos..pos + 20]), endianness);
        let mopt = input.read_i32()?;
        let mrows = input.read_i32()?;
        let ncols = input.read_i32()?;
        let imagf = input.read_i32()?;
        let namlen = input.read_i32()?;
        pos += 20;
        if mrows < 0 || ncols < 0 || namlen < 0 {
            return invalid("negative size in level 4 variable header");
        }

        let precision = (mopt / 10) % 10;
        let kind = mopt % 10;
        let mi_type = match precision {
            0 => MI_DOUBLE,
            1 => MI_SINGLE,
            2 => MI_INT32,
            3 => MI_INT16,
            4 => MI_UINT16,
            5 => MI_UINT8,
            _ => return invalid("unknown level 4 precision"),
        };
        let parts = if imagf != 0 { 2 } else { 1 };
        let data_len = (mrows as usize).checked_mul(ncols as usize)
            .and_then(|count| count.checked_mul(element_size(mi_type) * parts));
        let (name_end, data_len) = match (pos.checked_add(namlen as usize), data_len) {
            (Some(n), Some(d)) if n.checked_add(d).map_or(false, |end| end <= bytes.len()) => (n, d),
            _ => return invalid("level 4 variable extends past the end of the file"),
        };
        let name: String = bytes[pos..name_end].iter().take_while(|b| **b != 0).map(|b| *b as char).collect();
        pos = name_end;

        if kind == 0 && imagf == 0 {
            let values = decode_numeric(&bytes[pos..pos + data_len], mi_type, endianness)?;
            variables.insert(name, Array2::from_shape_vec((mrows as usize, ncols as usize).f(), values)?);
        } else {
            debug!("Skipping non-numeric or complex level 4 variable '{}'.", name);
        }
        pos += data_len;
    }
    Ok(variables)
}


fn level4_endianness(type_bytes: &[u8]) -> Result<Endianness> {
    let mut le = ByteOrdered::le(Cursor::new(type_bytes));
    let mopt = le.read_i32()?;
    if (0..1000).contains(&mopt) {
        return Ok(Endianness::Little);
    }
    let mut be = ByteOrdered::be(Cursor::new(type_bytes));
    let mopt = be.read_i32()?;
    if (1000..2000).contains(&mopt) {
        Ok(Endianness::Big)
    } else {
        invalid("unsupported level 4 machine format")
    }
}


/// Level 5: a 128 byte text header ending in the version and the `IM`/`MI` byte order
/// mark, followed by tagged data elements.
fn read_level5(bytes: &[u8]) -> Result<HashMap<String, Array2<f64>>> {
    if bytes.len() < MAT5_HEADER_SIZE {
        return invalid("level 5 header is truncated");
    }
    let endianness = match &bytes[126..128] {
        b"IM" => Endianness::Little,
        b"MI" => Endianness::Big,
        _ => return invalid("missing level 5 byte order mark"),
    };

    let mut variables = HashMap::new();
    let mut pos = MAT5_HEADER_SIZE;
    while bytes.len() - pos >= 8 {
        let (element, next) = read_element(bytes, pos, endianness)?;
        collect_variable(&element, endianness, &mut variables)?;
        pos = next;
    }
    Ok(variables)
}


struct Element<'a> {
    mi_type: u32,
    data: &'a [u8],
}


/// Read the tagged element at `pos`, returning it and the offset of the next one.
fn read_element(bytes: &[u8], pos: usize, endianness: Endianness) -> Result<(Element, usize)> {
    if bytes.len() - pos < 8 {
        return invalid("data element tag is truncated");
    }
    let mut tag = ByteOrdered::runtime(Cursor::new(&bytes[pos..pos + 8]), endianness);
    let first = tag.read_u32()?;
    let second = tag.read_u32()?;

    if first >> 16 != 0 {
        // Small element: type and size share the first word, data fits the second.
        let size = (first >> 16) as usize;
        if size > 4 {
            return invalid("small data element larger than 4 bytes");
        }
        return Ok((Element { mi_type: first & 0xffff, data: &bytes[pos + 4..pos + 4 + size] }, pos + 8));
    }

    let size = second as usize;
    let start = pos + 8;
    if size > bytes.len() - start {
        return invalid("data element extends past the end of the file");
    }
    let padded = if first == MI_COMPRESSED { size } else { (size + 7) / 8 * 8 };
    let next = (start + padded).min(bytes.len());
    Ok((Element { mi_type: first, data: &bytes[start..start + size] }, next))
}


fn collect_variable(element: &Element, endianness: Endianness, variables: &mut HashMap<String, Array2<f64>>) -> Result<()> {
    match element.mi_type {
        MI_MATRIX => {
            if let Some((name, matrix)) = read_matrix(element.data, endianness)? {
                variables.insert(name, matrix);
            }
        }
        MI_COMPRESSED => {
            let mut inflated = Vec::new();
            ZlibDecoder::new(element.data).read_to_end(&mut inflated)?;
            let (inner, _) = read_element(&inflated, 0, endianness)?;
            collect_variable(&inner, endianness, variables)?;
        }
        other => debug!("Skipping level 5 data element of type {}.", other),
    }
    Ok(())
}


/// Decode the sub-elements of a `miMATRIX` element: flags, dimensions, name and real part.
fn read_matrix(data: &[u8], endianness: Endianness) -> Result<Option<(String, Array2<f64>)>> {
    let (flags, pos) = read_element(data, 0, endianness)?;
    if flags.data.len() < 4 {
        return invalid("array flags are truncated");
    }
    let flag_word = ByteOrdered::runtime(Cursor::new(flags.data), endianness).read_u32()?;
    let class = flag_word & 0xff;

    let (dims, pos) = read_element(data, pos, endianness)?;
    let dims = decode_numeric(dims.data, dims.mi_type, endianness)?;
    let (name, pos) = read_element(data, pos, endianness)?;
    let name: String = name.data.iter().map(|b| *b as char).collect();

    if !(MX_DOUBLE_CLASS..=MX_UINT64_CLASS).contains(&class) || flag_word & MX_COMPLEX_FLAG != 0 {
        debug!("Skipping MAT variable '{}' of class {}.", name, class);
        return Ok(None);
    }
    if dims.len() != 2 {
        debug!("Skipping {}-dimensional MAT variable '{}'.", dims.len(), name);
        return Ok(None);
    }

    let (real, _) = read_element(data, pos, endianness)?;
    let values = decode_numeric(real.data, real.mi_type, endianness)?;
    let shape = (dims[0] as usize, dims[1] as usize);
    if shape.0.checked_mul(shape.1) != Some(values.len()) {
        return invalid("real part does not match the array dimensions");
    }
    Ok(Some((name, Array2::from_shape_vec(shape.f(), values)?)))
}


fn element_size(mi_type: u32) -> usize {
    match mi_type {
        MI_INT8 | MI_UINT8 => 1,
        MI_INT16 | MI_UINT16 => 2,
        MI_INT32 | MI_UINT32 | MI_SINGLE => 4,
        MI_DOUBLE | MI_INT64 | MI_UINT64 => 8,
        _ => 0,
    }
}


/// Decode a packed run of numbers of the given element type, widening each to `f64`.
fn decode_numeric(data: &[u8], mi_type: u32, endianness: Endianness) -> Result<Vec<f64>> {
    let size = element_size(mi_type);
    if size == 0 {
        return Err(NeurovolError::InvalidMatFile(format!("element type {} is not numeric", mi_type)));
    }
    let count = data.len() / size;
    let mut input = ByteOrdered::runtime(Cursor::new(data), endianness);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match mi_type {
            MI_INT8 => input.read_i8()? as f64,
            MI_UINT8 => input.read_u8()? as f64,
            MI_INT16 => input.read_i16()? as f64,
            MI_UINT16 => input.read_u16()? as f64,
            MI_INT32 => input.read_i32()? as f64,
            MI_UINT32 => input.read_u32()? as f64,
            MI_SINGLE => input.read_f32()? as f64,
            MI_DOUBLE => input.read_f64()?,
            MI_INT64 => input.read_i64()? as f64,
            _ => input.read_u64()? as f64,
        };
        values.push(v);
    }
    Ok(values)
}
