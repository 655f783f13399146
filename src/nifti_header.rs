//! The 348 byte header shared by NIFTI-1, Analyze 7.5 and SPM volumes, plus NIFTI extensions.
//!
//! The three dialects share one fixed binary layout. The byte order is not stored
//! explicitly, it is detected from the rank field `dim[0]` at byte offset 40, which
//! must lie in [1, 7]. The NIFTI magic at offset 344 distinguishes NIFTI from Analyze,
//! and whether the voxels follow in the same file (`n+1`) or a companion `.img`
//! file (`ni1`). Bytes 252..348 carry the NIFTI transform fields, while Analyze
//! interprets the same bytes as its `data_history` block, see `AnalyzeHistory`.

use byteordered::{ByteOrdered, Endianness};
use flate2::bufread::GzDecoder;
use log::{debug, warn};

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Write};
use std::path::Path;

use crate::error::{NeurovolError, Result};
use crate::nifti_transform::AffineTransform;
use crate::storage::{bitpix_for_datatype, DT_NONE};
use crate::util::{fill_fixed_length_field, fixed_length_string, is_gz_file, read_i16_at, read_up_to, write_i16_at};

/// Size of the fixed header struct in bytes, and the required value of `sizeof_hdr`.
pub const HEADER_SIZE: usize = 348;

/// Smallest voxel offset of a single file NIFTI: the struct plus the 4 byte extender.
pub const MIN_SINGLE_FILE_VOX_OFFSET: usize = 352;

pub const MAGIC_SINGLE_FILE: [u8; 4] = *b"n+1\0";
pub const MAGIC_DUAL_FILE: [u8; 4] = *b"ni1\0";

// Codes for qform_code and sform_code.
pub const NIFTI_XFORM_UNKNOWN: i16 = 0;
pub const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;
pub const NIFTI_XFORM_ALIGNED_ANAT: i16 = 2;
pub const NIFTI_XFORM_TALAIRACH: i16 = 3;
pub const NIFTI_XFORM_MNI_152: i16 = 4;

// Codes for xyzt_units. Spatial units use the low 3 bits, temporal units the next 3.
pub const NIFTI_UNITS_UNKNOWN: u8 = 0;
pub const NIFTI_UNITS_METER: u8 = 1;
pub const NIFTI_UNITS_MM: u8 = 2;
pub const NIFTI_UNITS_MICRON: u8 = 3;
pub const NIFTI_UNITS_SEC: u8 = 8;
pub const NIFTI_UNITS_MSEC: u8 = 16;
pub const NIFTI_UNITS_USEC: u8 = 24;
pub const NIFTI_UNITS_HZ: u8 = 32;
pub const NIFTI_UNITS_PPM: u8 = 40;

// Codes for slice_code.
pub const NIFTI_SLICE_UNKNOWN: u8 = 0;
pub const NIFTI_SLICE_SEQ_INC: u8 = 1;
pub const NIFTI_SLICE_SEQ_DEC: u8 = 2;
pub const NIFTI_SLICE_ALT_INC: u8 = 3;
pub const NIFTI_SLICE_ALT_DEC: u8 = 4;

// Codes for intent_code.
pub const NIFTI_INTENT_NONE: i16 = 0;
pub const NIFTI_INTENT_CORREL: i16 = 2;
pub const NIFTI_INTENT_TTEST: i16 = 3;
pub const NIFTI_INTENT_FTEST: i16 = 4;
pub const NIFTI_INTENT_ZSCORE: i16 = 5;
pub const NIFTI_INTENT_CHISQ: i16 = 6;
pub const NIFTI_INTENT_BETA: i16 = 7;
pub const NIFTI_INTENT_BINOM: i16 = 8;
pub const NIFTI_INTENT_GAMMA: i16 = 9;
pub const NIFTI_INTENT_POISSON: i16 = 10;
pub const NIFTI_INTENT_NORMAL: i16 = 11;
pub const NIFTI_INTENT_FTEST_NONC: i16 = 12;
pub const NIFTI_INTENT_CHISQ_NONC: i16 = 13;
pub const NIFTI_INTENT_LOGISTIC: i16 = 14;
pub const NIFTI_INTENT_LAPLACE: i16 = 15;
pub const NIFTI_INTENT_UNIFORM: i16 = 16;
pub const NIFTI_INTENT_TTEST_NONC: i16 = 17;
pub const NIFTI_INTENT_WEIBULL: i16 = 18;
pub const NIFTI_INTENT_CHI: i16 = 19;
pub const NIFTI_INTENT_INVGAUSS: i16 = 20;
pub const NIFTI_INTENT_EXTVAL: i16 = 21;
pub const NIFTI_INTENT_PVAL: i16 = 22;
pub const NIFTI_INTENT_ESTIMATE: i16 = 1001;
pub const NIFTI_INTENT_LABEL: i16 = 1002;
pub const NIFTI_INTENT_NEURONAME: i16 = 1003;
pub const NIFTI_INTENT_GENMATRIX: i16 = 1004;
pub const NIFTI_INTENT_SYMMATRIX: i16 = 1005;
pub const NIFTI_INTENT_DISPVECT: i16 = 1006;
pub const NIFTI_INTENT_VECTOR: i16 = 1007;
pub const NIFTI_INTENT_POINTSET: i16 = 1008;
pub const NIFTI_INTENT_TRIANGLE: i16 = 1009;
pub const NIFTI_INTENT_QUATERNION: i16 = 1010;

// Codes for NIFTI extension records.
pub const NIFTI_ECODE_IGNORE: i32 = 0;
pub const NIFTI_ECODE_DICOM: i32 = 2;
pub const NIFTI_ECODE_AFNI: i32 = 4;
pub const NIFTI_ECODE_COMMENT: i32 = 6;
pub const NIFTI_ECODE_XCEDE: i32 = 8;

/// Byte offset and width of every field, used to name the field a short buffer cuts into.
const FIELD_LAYOUT: [(&str, usize, usize); 43] = [
    ("sizeof_hdr", 0, 4), ("data_type", 4, 10), ("db_name", 14, 18), ("extents", 32, 4),
    ("session_error", 36, 2), ("regular", 38, 1), ("dim_info", 39, 1), ("dim", 40, 16),
    ("intent_p1", 56, 4), ("intent_p2", 60, 4), ("intent_p3", 64, 4), ("intent_code", 68, 2),
    ("datatype", 70, 2), ("bitpix", 72, 2), ("slice_start", 74, 2), ("pixdim", 76, 32),
    ("vox_offset", 108, 4), ("scl_slope", 112, 4), ("scl_inter", 116, 4), ("slice_end", 120, 2),
    ("slice_code", 122, 1), ("xyzt_units", 123, 1), ("cal_max", 124, 4), ("cal_min", 128, 4),
    ("slice_duration", 132, 4), ("toffset", 136, 4), ("glmax", 140, 4), ("glmin", 144, 4),
    ("descrip", 148, 80), ("aux_file", 228, 24), ("qform_code", 252, 2), ("sform_code", 254, 2),
    ("quatern_b", 256, 4), ("quatern_c", 260, 4), ("quatern_d", 264, 4), ("qoffset_x", 268, 4),
    ("qoffset_y", 272, 4), ("qoffset_z", 276, 4), ("srow_x", 280, 16), ("srow_y", 296, 16),
    ("srow_z", 312, 16), ("intent_name", 328, 16), ("magic", 344, 4),
];

/// Offset of the Analyze `data_history` block, which overlays the NIFTI transform fields.
const HISTORY_OFFSET: usize = 252;
const VOX_OFFSET_OFFSET: usize = 108;

/// The dialect a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    /// Analyze 7.5 with the transform taken from pixel spacing only.
    Analyze,
    /// Analyze 7.5 as written by SPM, with an origin field and an optional `.mat` companion.
    Spm,
    /// NIFTI-1 with the voxels in the same file, after the header and its extensions.
    NiftiSingleFile,
    /// NIFTI-1 with the voxels in a companion `.img` file.
    NiftiDualFile,
}

impl HeaderFormat {
    pub fn is_nifti(self) -> bool {
        matches!(self, HeaderFormat::NiftiSingleFile | HeaderFormat::NiftiDualFile)
    }
}


/// One NIFTI extension record. `data` excludes the 8 byte size and code tag.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiExtension {
    pub code: i32,
    pub data: Vec<u8>,
}

impl NiftiExtension {
    pub fn new(code: i32, data: Vec<u8>) -> NiftiExtension {
        NiftiExtension { code, data }
    }

    /// Size of the record on disk, including the tag and padding to a multiple of 16 bytes.
    pub fn encoded_len(&self) -> usize {
        (8 + self.data.len() + 15) / 16 * 16
    }

    fn write_to<W: Write>(&self, output: &mut ByteOrdered<W, Endianness>) -> Result<()> {
        let size = self.encoded_len();
        output.write_i32(size as i32)?;
        output.write_i32(self.code)?;
        output.write_all(&self.data)?;
        output.write_all(&vec![0u8; size - 8 - self.data.len()])?;
        Ok(())
    }

    /// Decode consecutive records from `bytes`, which starts at absolute offset `base` in the file.
    /// A zero size and code pair marks the start of padding and ends the list.
    fn decode_all(bytes: &[u8], base: usize, endianness: Endianness) -> Result<Vec<NiftiExtension>> {
        let mut extensions = Vec::new();
        let mut pos = 0;
        while bytes.len() - pos >= 8 {
            let mut tag = ByteOrdered::runtime(Cursor::new(&bytes[pos..pos + 8]), endianness);
            let size = tag.read_i32()?;
            let code = tag.read_i32()?;
            if size == 0 && code == 0 {
                break;
            }
            if size < 8 || size as usize > bytes.len() - pos {
                return Err(NeurovolError::InvalidExtension(base + pos));
            }
            let size = size as usize;
            extensions.push(NiftiExtension::new(code, bytes[pos + 8..pos + size].to_vec()));
            pos += size;
        }
        debug!("Decoded {} NIFTI extension(s).", extensions.len());
        Ok(extensions)
    }
}


/// The Analyze 7.5 `data_history` block at bytes 252..348.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalyzeHistory {
    pub orient: u8,
    pub originator: [u8; 10],
    pub generated: [u8; 10],
    pub scannum: [u8; 10],
    pub patient_id: [u8; 10],
    pub exp_date: [u8; 10],
    pub exp_time: [u8; 10],
    pub hist_un0: [u8; 3],
    pub views: i32,
    pub vols_added: i32,
    pub start_field: i32,
    pub field_skip: i32,
    pub omax: i32,
    pub omin: i32,
    pub smax: i32,
    pub smin: i32,
}

impl AnalyzeHistory {
    fn read_from<R: Read>(input: &mut ByteOrdered<R, Endianness>) -> Result<AnalyzeHistory> {
        let mut hist = AnalyzeHistory::default();
        hist.orient = input.read_u8()?;
        input.read_exact(&mut hist.originator)?;
        input.read_exact(&mut hist.generated)?;
        input.read_exact(&mut hist.scannum)?;
        input.read_exact(&mut hist.patient_id)?;
        input.read_exact(&mut hist.exp_date)?;
        input.read_exact(&mut hist.exp_time)?;
        input.read_exact(&mut hist.hist_un0)?;
        hist.views = input.read_i32()?;
        hist.vols_added = input.read_i32()?;
        hist.start_field = input.read_i32()?;
        hist.field_skip = input.read_i32()?;
        hist.omax = input.read_i32()?;
        hist.omin = input.read_i32()?;
        hist.smax = input.read_i32()?;
        hist.smin = input.read_i32()?;
        Ok(hist)
    }

    fn write_to<W: Write>(&self, output: &mut ByteOrdered<W, Endianness>) -> Result<()> {
        output.write_u8(self.orient)?;
        output.write_all(&self.originator)?;
        output.write_all(&self.generated)?;
        output.write_all(&self.scannum)?;
        output.write_all(&self.patient_id)?;
        output.write_all(&self.exp_date)?;
        output.write_all(&self.exp_time)?;
        output.write_all(&self.hist_un0)?;
        for v in &[self.views, self.vols_added, self.start_field, self.field_skip, self.omax, self.omin, self.smax, self.smin] {
            output.write_i32(*v)?;
        }
        Ok(())
    }
}


/// Models the header of a NIFTI-1, Analyze 7.5 or SPM volume.
///
/// Fields use the NIFTI-1 names. For Analyze files, `scl_slope` and `scl_inter` hold
/// `funused1` and `funused2`, and the fields from `qform_code` on hold the raw bytes of
/// the `data_history` block, which `analyze_history()` decodes.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeHeader {
    pub sizeof_hdr: i32,
    pub data_type: [u8; 10],
    pub db_name: [u8; 18],
    pub extents: i32,
    pub session_error: i16,
    pub regular: u8,
    pub dim_info: u8,
    pub dim: [i16; 8],
    pub intent_p1: f32,
    pub intent_p2: f32,
    pub intent_p3: f32,
    pub intent_code: i16,
    pub datatype: i16,
    pub bitpix: i16,
    pub slice_start: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub slice_end: i16,
    pub slice_code: u8,
    pub xyzt_units: u8,
    pub cal_max: f32,
    pub cal_min: f32,
    pub slice_duration: f32,
    pub toffset: f32,
    pub glmax: i32,
    pub glmin: i32,
    pub descrip: [u8; 80],
    pub aux_file: [u8; 24],
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern_b: f32,
    pub quatern_c: f32,
    pub quatern_d: f32,
    pub qoffset_x: f32,
    pub qoffset_y: f32,
    pub qoffset_z: f32,
    pub srow_x: [f32; 4],
    pub srow_y: [f32; 4],
    pub srow_z: [f32; 4],
    pub intent_name: [u8; 16],
    pub magic: [u8; 4],
    /// The 4 bytes at offset 348. `None` when the header was decoded from exactly 348 bytes.
    pub extender: Option<[u8; 4]>,
    /// Byte order of the header and its voxel stream.
    pub endianness: Endianness,
    /// Whether a non-NIFTI header is treated as the SPM dialect.
    pub spm: bool,
}


impl Default for VolumeHeader {
    fn default() -> VolumeHeader {
        VolumeHeader {
            sizeof_hdr: HEADER_SIZE as i32,
            data_type: [0; 10],
            db_name: [0; 18],
            extents: 0,
            session_error: 0,
            regular: 0,
            dim_info: 0,
            dim: [3, 1, 1, 1, 1, 1, 1, 1],
            intent_p1: 0.,
            intent_p2: 0.,
            intent_p3: 0.,
            intent_code: NIFTI_INTENT_NONE,
            datatype: DT_NONE,
            bitpix: 0,
            slice_start: 0,
            pixdim: [1., 0., 0., 0., 0., 0., 0., 0.],
            vox_offset: 0.,
            scl_slope: 0.,
            scl_inter: 0.,
            slice_end: 0,
            slice_code: NIFTI_SLICE_UNKNOWN,
            xyzt_units: NIFTI_UNITS_UNKNOWN,
            cal_max: 0.,
            cal_min: 0.,
            slice_duration: 0.,
            toffset: 0.,
            glmax: 0,
            glmin: 0,
            descrip: [0; 80],
            aux_file: [0; 24],
            qform_code: NIFTI_XFORM_UNKNOWN,
            sform_code: NIFTI_XFORM_UNKNOWN,
            quatern_b: 0.,
            quatern_c: 0.,
            quatern_d: 0.,
            qoffset_x: 0.,
            qoffset_y: 0.,
            qoffset_z: 0.,
            srow_x: [0.; 4],
            srow_y: [0.; 4],
            srow_z: [0.; 4],
            intent_name: [0; 16],
            magic: [0; 4],
            extender: None,
            endianness: Endianness::Big,
            spm: false,
        }
    }
}


/// Detect the byte order from the rank field `dim[0]` at offset 40, trying little endian first.
pub fn detect_endianness(bytes: &[u8]) -> Result<Endianness> {
    if bytes.len() < 42 {
        return Err(NeurovolError::TruncatedHeader("dim", 40));
    }
    let rank = &bytes[40..42];
    if (1..=7).contains(&read_i16_at(Endianness::Little, rank)) {
        Ok(Endianness::Little)
    } else if (1..=7).contains(&read_i16_at(Endianness::Big, rank)) {
        Ok(Endianness::Big)
    } else {
        Err(NeurovolError::BadByteOrder)
    }
}


/// Whether the 4 magic bytes follow the NIFTI pattern `n`, `+` or `i`, a digit, `\0`.
fn is_nifti_magic(magic: &[u8; 4]) -> bool {
    magic[0] == b'n' && (magic[1] == b'+' || magic[1] == b'i') && magic[2].is_ascii_digit() && magic[3] == 0
}


impl VolumeHeader {

    /// A blank NIFTI-1 header in the given byte order.
    ///
    /// The header has an identity sform with `sform_code` 1 and unit spacing flag
    /// `pixdim[0] = 1`. A single file header gets `vox_offset` 352 and the `n+1` magic,
    /// a dual file header gets `vox_offset` 0 and the `ni1` magic.
    pub fn new(endianness: Endianness, single_file: bool) -> VolumeHeader {
        VolumeHeader {
            vox_offset: if single_file { MIN_SINGLE_FILE_VOX_OFFSET as f32 } else { 0. },
            sform_code: NIFTI_XFORM_SCANNER_ANAT,
            srow_x: [1., 0., 0., 0.],
            srow_y: [0., 1., 0., 0.],
            srow_z: [0., 0., 1., 0.],
            magic: if single_file { MAGIC_SINGLE_FILE } else { MAGIC_DUAL_FILE },
            extender: Some([0; 4]),
            endianness,
            ..VolumeHeader::default()
        }
    }


    /// Decode a header from a byte buffer holding at least the 348 byte struct.
    /// If the buffer holds 4 more bytes, they are kept as the extender.
    pub fn from_bytes(bytes: &[u8], spm: bool) -> Result<VolumeHeader> {
        if bytes.len() < HEADER_SIZE {
            return Err(truncated_at(bytes.len()));
        }
        let endianness = detect_endianness(bytes)?;
        let mut input = ByteOrdered::runtime(Cursor::new(&bytes[..HEADER_SIZE]), endianness);
        let mut hdr = VolumeHeader { endianness, spm, ..VolumeHeader::default() };

        hdr.sizeof_hdr = input.read_i32()?;
        if hdr.sizeof_hdr != HEADER_SIZE as i32 {
            return Err(NeurovolError::InvalidHeaderSize(hdr.sizeof_hdr));
        }
        input.read_exact(&mut hdr.data_type)?;
        input.read_exact(&mut hdr.db_name)?;
        hdr.extents = input.read_i32()?;
        hdr.session_error = input.read_i16()?;
        hdr.regular = input.read_u8()?;
        hdr.dim_info = input.read_u8()?;
        for v in &mut hdr.dim { *v = input.read_i16()?; }
        hdr.intent_p1 = input.read_f32()?;
        hdr.intent_p2 = input.read_f32()?;
        hdr.intent_p3 = input.read_f32()?;
        hdr.intent_code = input.read_i16()?;
        hdr.datatype = input.read_i16()?;
        hdr.bitpix = input.read_i16()?;
        hdr.slice_start = input.read_i16()?;
        for v in &mut hdr.pixdim { *v = input.read_f32()?; }
        hdr.vox_offset = input.read_f32()?;
        hdr.scl_slope = input.read_f32()?;
        hdr.scl_inter = input.read_f32()?;
        hdr.slice_end = input.read_i16()?;
        hdr.slice_code = input.read_u8()?;
        hdr.xyzt_units = input.read_u8()?;
        hdr.cal_max = input.read_f32()?;
        hdr.cal_min = input.read_f32()?;
        hdr.slice_duration = input.read_f32()?;
        hdr.toffset = input.read_f32()?;
        hdr.glmax = input.read_i32()?;
        hdr.glmin = input.read_i32()?;
        input.read_exact(&mut hdr.descrip)?;
        input.read_exact(&mut hdr.aux_file)?;
        hdr.read_transform_block(&mut input)?;

        if bytes.len() >= MIN_SINGLE_FILE_VOX_OFFSET {
            let mut extender = [0u8; 4];
            extender.copy_from_slice(&bytes[HEADER_SIZE..MIN_SINGLE_FILE_VOX_OFFSET]);
            hdr.extender = Some(extender);
        }
        debug!("Decoded {:?} header in {:?} byte order.", hdr.format(), endianness);
        Ok(hdr)
    }


    /// Read a header and its NIFTI extensions from the given byte stream.
    /// It is assumed that the input is currently at the start of the header.
    ///
    /// For a single file NIFTI, the stream is left at the first voxel. For a dual
    /// file NIFTI the rest of the stream is consumed as the extension area.
    pub fn read_with_extensions<S: Read>(input: &mut S, spm: bool) -> Result<(VolumeHeader, Vec<NiftiExtension>)> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        let got = read_up_to(input, &mut bytes)?;
        bytes.truncate(got);
        let hdr = VolumeHeader::from_bytes(&bytes, spm)?;

        match hdr.format() {
            HeaderFormat::NiftiSingleFile => {
                // Sized by what the stream delivers, not by vox_offset.
                let wanted = (hdr.data_offset() - HEADER_SIZE) as u64;
                let got = input.by_ref().take(wanted).read_to_end(&mut bytes)? as u64;
                if got < wanted {
                    return Err(NeurovolError::TruncatedHeader("vox_offset", VOX_OFFSET_OFFSET));
                }
            }
            HeaderFormat::NiftiDualFile => {
                input.read_to_end(&mut bytes)?;
            }
            _ => {}
        }

        let hdr = VolumeHeader::from_bytes(&bytes, spm)?;
        let extensions = hdr.extensions_from_bytes(&bytes)?;
        Ok((hdr, extensions))
    }


    /// Read a header from the given byte stream, skipping any extensions.
    pub fn from_reader<S: Read>(input: &mut S, spm: bool) -> Result<VolumeHeader> {
        VolumeHeader::read_with_extensions(input, spm).map(|(hdr, _)| hdr)
    }


    /// Read a header from a file.
    /// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
    pub fn from_file<P: AsRef<Path>>(path: P, spm: bool) -> Result<VolumeHeader> {
        let gz = is_gz_file(&path);
        let mut file = BufReader::new(File::open(path)?);
        if gz {
            VolumeHeader::from_reader(&mut GzDecoder::new(file), spm)
        } else {
            VolumeHeader::from_reader(&mut file, spm)
        }
    }


    /// Decode the extension records from a buffer that starts with this header.
    /// Records are only present when the first extender byte is non-zero.
    pub fn extensions_from_bytes(&self, bytes: &[u8]) -> Result<Vec<NiftiExtension>> {
        let flagged = self.extender.map(|e| e[0] != 0).unwrap_or(false);
        if !self.format().is_nifti() || !flagged {
            return Ok(Vec::new());
        }
        let end = match self.format() {
            HeaderFormat::NiftiSingleFile => self.data_offset().min(bytes.len()),
            _ => bytes.len(),
        };
        if end <= MIN_SINGLE_FILE_VOX_OFFSET {
            return Ok(Vec::new());
        }
        NiftiExtension::decode_all(&bytes[MIN_SINGLE_FILE_VOX_OFFSET..end], MIN_SINGLE_FILE_VOX_OFFSET, self.endianness)
    }


    /// Encode the header, followed for NIFTI headers by the extender and the extension records.
    ///
    /// For a single file NIFTI the written `vox_offset` is raised to point past all
    /// extensions when needed, and the output is zero padded up to it, so voxel data
    /// can be appended directly. Analyze headers are written as the bare 348 byte struct.
    pub fn to_bytes(&self, extensions: &[NiftiExtension]) -> Result<Vec<u8>> {
        let format = self.format();
        let ext_len: usize = extensions.iter().map(|e| e.encoded_len()).sum();
        if !format.is_nifti() && !extensions.is_empty() {
            warn!("Ignoring {} extension(s): {:?} headers cannot carry extensions.", extensions.len(), format);
        }

        if !self.vox_offset.is_finite() || self.vox_offset < 0. || self.vox_offset > i32::MAX as f32 {
            return Err(NeurovolError::InvalidVoxOffset(self.vox_offset));
        }
        let vox_offset = if format == HeaderFormat::NiftiSingleFile {
            let needed = (MIN_SINGLE_FILE_VOX_OFFSET + ext_len) as f32;
            if self.vox_offset < needed { needed } else { self.vox_offset }
        } else {
            self.vox_offset
        };

        let mut bytes: Vec<u8> = Vec::with_capacity(MIN_SINGLE_FILE_VOX_OFFSET + ext_len);
        {
            let mut output = ByteOrdered::runtime(&mut bytes, self.endianness);
            output.write_i32(HEADER_SIZE as i32)?;
            output.write_all(&self.data_type)?;
            output.write_all(&self.db_name)?;
            output.write_i32(self.extents)?;
            output.write_i16(self.session_error)?;
            output.write_u8(self.regular)?;
            output.write_u8(self.dim_info)?;
            for v in &self.dim { output.write_i16(*v)?; }
            output.write_f32(self.intent_p1)?;
            output.write_f32(self.intent_p2)?;
            output.write_f32(self.intent_p3)?;
            output.write_i16(self.intent_code)?;
            output.write_i16(self.datatype)?;
            output.write_i16(self.bitpix)?;
            output.write_i16(self.slice_start)?;
            for v in &self.pixdim { output.write_f32(*v)?; }
            output.write_f32(vox_offset)?;
            output.write_f32(self.scl_slope)?;
            output.write_f32(self.scl_inter)?;
            output.write_i16(self.slice_end)?;
            output.write_u8(self.slice_code)?;
            output.write_u8(self.xyzt_units)?;
            output.write_f32(self.cal_max)?;
            output.write_f32(self.cal_min)?;
            output.write_f32(self.slice_duration)?;
            output.write_f32(self.toffset)?;
            output.write_i32(self.glmax)?;
            output.write_i32(self.glmin)?;
            output.write_all(&self.descrip)?;
            output.write_all(&self.aux_file)?;
            self.write_transform_block(&mut output)?;

            let write_extender = format == HeaderFormat::NiftiSingleFile
                || (format.is_nifti() && (self.extender.is_some() || !extensions.is_empty()));
            if write_extender {
                let mut extender = self.extender.unwrap_or([0; 4]);
                extender[0] = if extensions.is_empty() { 0 } else { 1 };
                output.write_all(&extender)?;
                for extension in extensions {
                    extension.write_to(&mut output)?;
                }
            }
        }

        if format == HeaderFormat::NiftiSingleFile && bytes.len() < vox_offset as usize {
            bytes.resize(vox_offset as usize, 0);
        }
        Ok(bytes)
    }


    /// Write the encoded header and extensions to the given stream.
    pub fn write_to<W: Write>(&self, output: &mut W, extensions: &[NiftiExtension]) -> Result<()> {
        output.write_all(&self.to_bytes(extensions)?)?;
        Ok(())
    }


    fn read_transform_block<R: Read>(&mut self, input: &mut ByteOrdered<R, Endianness>) -> Result<()> {
        self.qform_code = input.read_i16()?;
        self.sform_code = input.read_i16()?;
        self.quatern_b = input.read_f32()?;
        self.quatern_c = input.read_f32()?;
        self.quatern_d = input.read_f32()?;
        self.qoffset_x = input.read_f32()?;
        self.qoffset_y = input.read_f32()?;
        self.qoffset_z = input.read_f32()?;
        for v in &mut self.srow_x { *v = input.read_f32()?; }
        for v in &mut self.srow_y { *v = input.read_f32()?; }
        for v in &mut self.srow_z { *v = input.read_f32()?; }
        input.read_exact(&mut self.intent_name)?;
        input.read_exact(&mut self.magic)?;
        Ok(())
    }


    fn write_transform_block<W: Write>(&self, output: &mut ByteOrdered<W, Endianness>) -> Result<()> {
        output.write_i16(self.qform_code)?;
        output.write_i16(self.sform_code)?;
        for v in &[self.quatern_b, self.quatern_c, self.quatern_d, self.qoffset_x, self.qoffset_y, self.qoffset_z] {
            output.write_f32(*v)?;
        }
        for v in self.srow_x.iter().chain(&self.srow_y).chain(&self.srow_z) {
            output.write_f32(*v)?;
        }
        output.write_all(&self.intent_name)?;
        output.write_all(&self.magic)?;
        Ok(())
    }


    /// The raw bytes 252..348 in the header byte order.
    fn history_block(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE - HISTORY_OFFSET);
        self.write_transform_block(&mut ByteOrdered::runtime(&mut bytes, self.endianness))?;
        Ok(bytes)
    }


    fn set_history_block(&mut self, bytes: &[u8]) -> Result<()> {
        let mut input = ByteOrdered::runtime(Cursor::new(bytes), self.endianness);
        self.read_transform_block(&mut input)
    }


    /// The dialect of this header. A NIFTI magic wins over the SPM flag.
    pub fn format(&self) -> HeaderFormat {
        if is_nifti_magic(&self.magic) {
            if self.magic[1] == b'+' { HeaderFormat::NiftiSingleFile } else { HeaderFormat::NiftiDualFile }
        } else if self.spm {
            HeaderFormat::Spm
        } else {
            HeaderFormat::Analyze
        }
    }


    /// The digit of the NIFTI magic, `None` for Analyze and SPM headers.
    pub fn nifti_version(&self) -> Option<u8> {
        if is_nifti_magic(&self.magic) { Some(self.magic[2] - b'0') } else { None }
    }


    /// Byte offset of the first voxel in the image stream.
    /// Single file NIFTI volumes never start before byte 352.
    pub fn data_offset(&self) -> usize {
        let offset = self.vox_offset.max(0.) as usize;
        if self.format() == HeaderFormat::NiftiSingleFile {
            offset.max(MIN_SINGLE_FILE_VOX_OFFSET)
        } else {
            offset
        }
    }


    /// Set the datatype and derive `bitpix` from it.
    /// Unknown codes are kept with a warning and `bitpix` 0.
    pub fn set_datatype(&mut self, datatype: i16) {
        self.datatype = datatype;
        match bitpix_for_datatype(datatype) {
            Some(bitpix) => self.bitpix = bitpix,
            None => {
                warn!("Unknown datatype code {}, setting bitpix to 0.", datatype);
                self.bitpix = 0;
            }
        }
    }

    pub fn with_datatype(mut self, datatype: i16) -> VolumeHeader {
        self.set_datatype(datatype);
        self
    }

    pub fn with_dim(mut self, dim: [i16; 8]) -> VolumeHeader {
        self.dim = dim;
        self
    }

    pub fn with_pixdim(mut self, pixdim: [f32; 8]) -> VolumeHeader {
        self.pixdim = pixdim;
        self
    }

    pub fn with_intent(mut self, intent_code: i16, intent_name: &str) -> VolumeHeader {
        self.intent_code = intent_code;
        fill_fixed_length_field(&mut self.intent_name, intent_name);
        self
    }

    pub fn with_qform(mut self, qform_code: i16, quatern: [f32; 3], offset: [f32; 3]) -> VolumeHeader {
        self.qform_code = qform_code;
        self.quatern_b = quatern[0];
        self.quatern_c = quatern[1];
        self.quatern_d = quatern[2];
        self.qoffset_x = offset[0];
        self.qoffset_y = offset[1];
        self.qoffset_z = offset[2];
        self
    }

    pub fn with_sform(mut self, sform_code: i16, rows: [[f32; 4]; 3]) -> VolumeHeader {
        self.sform_code = sform_code;
        self.srow_x = rows[0];
        self.srow_y = rows[1];
        self.srow_z = rows[2];
        self
    }

    pub fn with_description(mut self, description: &str) -> VolumeHeader {
        self.set_description(description);
        self
    }

    /// Copy the first three rows of `transform` into the sform rows and set `sform_code`.
    pub fn set_sform_from_transform(&mut self, transform: &AffineTransform, sform_code: i16) {
        let m = transform.matrix();
        for (row, dst) in [&mut self.srow_x, &mut self.srow_y, &mut self.srow_z].iter_mut().enumerate() {
            for col in 0..4 {
                dst[col] = m[row][col] as f32;
            }
        }
        self.sform_code = sform_code;
    }

    pub fn description(&self) -> String {
        fixed_length_string(&self.descrip)
    }

    pub fn set_description(&mut self, description: &str) {
        fill_fixed_length_field(&mut self.descrip, description);
    }

    pub fn aux_file_name(&self) -> String {
        fixed_length_string(&self.aux_file)
    }

    pub fn intent_name_str(&self) -> String {
        fixed_length_string(&self.intent_name)
    }

    /// The sign of `pixdim[0]`, which flips the third axis of the quaternion transform.
    pub fn qfac(&self) -> f64 {
        if self.pixdim[0] < 0. { -1. } else { 1. }
    }

    /// Spatial and temporal units from `xyzt_units`.
    pub fn units(&self) -> (u8, u8) {
        (self.xyzt_units & 0x07, self.xyzt_units & 0x38)
    }

    /// The intensity scale factor, `scl_slope` for NIFTI and `funused1` for SPM.
    pub fn scale_factor(&self) -> f32 {
        self.scl_slope
    }

    /// The bytes 252..348 interpreted as the Analyze 7.5 `data_history` block.
    pub fn analyze_history(&self) -> Result<AnalyzeHistory> {
        let bytes = self.history_block()?;
        AnalyzeHistory::read_from(&mut ByteOrdered::runtime(Cursor::new(&bytes[..]), self.endianness))
    }

    /// Overwrite bytes 252..348 with the given Analyze 7.5 `data_history` block.
    pub fn set_analyze_history(&mut self, history: &AnalyzeHistory) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE - HISTORY_OFFSET);
        history.write_to(&mut ByteOrdered::runtime(&mut bytes, self.endianness))?;
        self.set_history_block(&bytes)
    }

    /// The SPM origin: three `i16` at offset 253, inside the Analyze `originator` field.
    pub fn origin(&self) -> Result<[i16; 3]> {
        let bytes = self.history_block()?;
        let mut origin = [0i16; 3];
        for (idx, v) in origin.iter_mut().enumerate() {
            let start = 1 + 2 * idx;
            *v = read_i16_at(self.endianness, &bytes[start..start + 2]);
        }
        Ok(origin)
    }

    pub fn set_origin(&mut self, origin: [i16; 3]) -> Result<()> {
        let mut bytes = self.history_block()?;
        for (idx, v) in origin.iter().enumerate() {
            let start = 1 + 2 * idx;
            write_i16_at(self.endianness, &mut bytes[start..start + 2], *v);
        }
        self.set_history_block(&bytes)
    }
}


/// The error for a header buffer of only `len` bytes, naming the first field it cuts into.
fn truncated_at(len: usize) -> NeurovolError {
    let (field, offset, _) = FIELD_LAYOUT.iter()
        .find(|(_, offset, size)| offset + size > len)
        .copied()
        .unwrap_or(("magic", 344, 4));
    NeurovolError::TruncatedHeader(field, offset)
}
