//! Reading and writing of volumes stored as NIFTI-1, Analyze 7.5 or SPM files.
//!
//! A volume is either a single `.nii` file, or a `.hdr` header next to an `.img`
//! image. Both may be gzip compressed. An SPM volume may come with a `.mat` file
//! holding its transform.

use byteordered::Endianness;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{NeurovolError, Result};
use crate::matfile::MatFile;
use crate::nifti_header::{NiftiExtension, VolumeHeader, NIFTI_UNITS_MM, NIFTI_UNITS_SEC, NIFTI_XFORM_SCANNER_ANAT};
use crate::nifti_transform::{resolve_transform, MatrixSource, ResolvedTransform};
use crate::storage::{StorageKind, VoxelBuffer, DEFAULT_CHUNK_BYTES};
use crate::util::{is_gz_file, path_with_suffix};
use crate::volume::{Extents, IndexedVolume, VolumeArray};

/// File name endings recognized when deriving the common stem of companion files.
const KNOWN_SUFFIXES: [&str; 10] = [
    ".collection.xml", ".atlas.xml", ".nii.gz", ".img.gz", ".hdr.gz", ".nii", ".hdr", ".imgz", ".img", ".mat",
];

const IMAGE_SUFFIXES: [&str; 3] = [".img", ".imgz", ".img.gz"];


/// Options for reading volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    /// Treat Analyze headers as SPM, using the origin field and the `.mat` companion.
    pub spm: bool,
    /// For NIFTI files with both forms set, use the qform rather than the sform.
    pub prefer_standard_space: bool,
    /// Size of the transfer buffer used when decoding voxels.
    pub chunk_bytes: usize,
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions { spm: true, prefer_standard_space: true, chunk_bytes: DEFAULT_CHUNK_BYTES }
    }
}


/// Options for writing volumes. The layout and compression follow from the file name.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    pub endianness: Endianness,
    pub sform_code: i16,
    pub intent_code: i16,
    pub extensions: Vec<NiftiExtension>,
    pub chunk_bytes: usize,
}

impl Default for WriteOptions {
    fn default() -> WriteOptions {
        WriteOptions {
            endianness: Endianness::Big,
            sform_code: NIFTI_XFORM_SCANNER_ANAT,
            intent_code: 0,
            extensions: Vec::new(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}


/// The files making up one volume on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanionFiles {
    pub header: PathBuf,
    pub image: PathBuf,
    pub matrix: Option<PathBuf>,
    pub label_index: Option<PathBuf>,
    pub collection: Option<PathBuf>,
}

/// Split `path` into its stem and the recognized suffix, if any.
fn split_known_suffix(path: &Path) -> (PathBuf, Option<&'static str>) {
    let name = path.to_string_lossy();
    for suffix in KNOWN_SUFFIXES.iter() {
        if name.ends_with(suffix) {
            return (PathBuf::from(&name[..name.len() - suffix.len()]), Some(*suffix));
        }
    }
    (path.to_path_buf(), None)
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    if path.is_file() { Some(path) } else { None }
}

impl CompanionFiles {

    /// Locate the header, image and optional companions of the volume at `path`.
    ///
    /// `path` may name any of the files, or their common stem. A `.nii` file is its
    /// own header and image. Otherwise the stem gets `.hdr` for the header and the
    /// first existing of `.img`, `.imgz` and `.img.gz` for the image.
    pub fn discover<P: AsRef<Path>>(path: P) -> Result<CompanionFiles> {
        let path = path.as_ref();
        let (stem, suffix) = split_known_suffix(path);

        let single = match suffix {
            Some(".nii") | Some(".nii.gz") => Some(path.to_path_buf()),
            None => existing(path_with_suffix(&stem, ".nii")).or_else(|| existing(path_with_suffix(&stem, ".nii.gz"))),
            _ => None,
        };

        let (header, image) = match single {
            Some(file) => {
                if !file.is_file() {
                    return Err(NeurovolError::MissingCompanion(file));
                }
                (file.clone(), file)
            }
            None => {
                let header = match suffix {
                    Some(".hdr.gz") => path.to_path_buf(),
                    _ => path_with_suffix(&stem, ".hdr"),
                };
                if !header.is_file() {
                    return Err(NeurovolError::MissingCompanion(header));
                }
                let image = IMAGE_SUFFIXES.iter()
                    .find_map(|s| existing(path_with_suffix(&stem, s)))
                    .ok_or_else(|| NeurovolError::MissingCompanion(path_with_suffix(&stem, ".img")))?;
                (header, image)
            }
        };

        let files = CompanionFiles {
            header,
            image,
            matrix: existing(path_with_suffix(&stem, ".mat")),
            label_index: existing(path_with_suffix(&stem, ".atlas.xml")),
            collection: existing(path_with_suffix(&stem, ".collection.xml")),
        };
        debug!("Companion files for '{}': {:?}", path.display(), files);
        Ok(files)
    }

    pub fn is_single_file(&self) -> bool {
        self.header == self.image
    }

    fn image_is_compressed(&self) -> bool {
        is_gz_file(&self.image) || self.image.to_string_lossy().ends_with(".imgz")
    }
}


/// Open a file for reading, inflating it if `gz` is set.
fn open_reader(path: &Path, gz: bool) -> Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    if gz {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}


/// A volume on disk with its decoded header and resolved transform.
#[derive(Debug, Clone)]
pub struct VolumeFile {
    pub files: CompanionFiles,
    pub header: VolumeHeader,
    pub extensions: Vec<NiftiExtension>,
    pub transform: ResolvedTransform,
    options: ReadOptions,
}

impl VolumeFile {

    /// Locate the files of a volume, decode its header and resolve its transform.
    /// The voxels are not read yet.
    pub fn open<P: AsRef<Path>>(path: P, options: &ReadOptions) -> Result<VolumeFile> {
        let files = CompanionFiles::discover(path)?;
        let mut input = open_reader(&files.header, is_gz_file(&files.header))?;
        let (header, extensions) = VolumeHeader::read_with_extensions(&mut input, options.spm)?;

        let matrix = match (&files.matrix, header.spm) {
            (Some(mat_path), true) => match MatFile::from_file(mat_path) {
                Ok(mat) => Some(mat),
                Err(e) => {
                    warn!("Cannot read SPM matrix file '{}': {}", mat_path.display(), e);
                    None
                }
            },
            _ => None,
        };
        let transform = resolve_transform(&header, options.prefer_standard_space, matrix.as_ref().map(|m| m as &dyn MatrixSource));

        Ok(VolumeFile { files, header, extensions, transform, options: options.clone() })
    }

    pub fn extents(&self) -> Extents {
        Extents::from_dims(&self.header.dim)
    }

    /// The storage kind of the voxels, an error for datatypes without storage.
    pub fn storage_kind(&self) -> Result<StorageKind> {
        StorageKind::from_datatype(self.header.datatype)
    }

    /// Decode the voxels into a volume.
    pub fn read_volume(&self) -> Result<IndexedVolume> {
        let kind = self.storage_kind()?;
        let extents = self.extents();
        let count = extents.checked_num_voxels().ok_or(NeurovolError::TooManyVoxels)?;
        let mut input = open_reader(&self.files.image, self.files.image_is_compressed())?;

        let offset = self.header.data_offset() as u64;
        let skipped = io::copy(&mut input.by_ref().take(offset), &mut io::sink())?;
        if skipped < offset {
            return Err(NeurovolError::TruncatedImage(count, 0));
        }

        debug!("Reading {:?} voxels of kind {} from '{}' at offset {}.", extents, kind, self.files.image.display(), offset);
        let data = VoxelBuffer::read_from(&mut input, kind, count, self.header.endianness, self.options.chunk_bytes)?;
        IndexedVolume::new(extents, self.transform.matrix, data)
    }
}


/// Read a volume with the default options.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<IndexedVolume> {
    VolumeFile::open(path, &ReadOptions::default())?.read_volume()
}


/// Build a NIFTI header describing `volume`.
///
/// The header has rank 5, pixel spacing from the absolute column sums of the
/// transform, the transform as its sform, millimeter and second units, and the image
/// range as calibration range.
pub fn header_from_volume<V: VolumeArray>(volume: &V, options: &WriteOptions, single_file: bool) -> Result<VolumeHeader> {
    let mut hdr = VolumeHeader::new(options.endianness, single_file);
    let e = volume.extents();
    let mut dim = [5i16, 0, 0, 0, 0, 0, 0, 0];
    for (d, extent) in dim[1..6].iter_mut().zip(&e.as_array()) {
        *d = i16::try_from(*extent).map_err(|_| NeurovolError::ExtentTooLarge(*extent))?;
    }
    hdr.dim = dim;
    hdr.set_datatype(volume.storage_type().datatype());

    let transform = volume.geometry().index_to_space();
    let spacing = transform.column_abs_sums();
    hdr.pixdim = [1., spacing[0] as f32, spacing[1] as f32, spacing[2] as f32, 1., 1., 0., 0.];
    hdr.set_sform_from_transform(transform, options.sform_code);
    hdr.intent_code = options.intent_code;
    hdr.xyzt_units = NIFTI_UNITS_MM | NIFTI_UNITS_SEC;

    let (min, max) = volume.image_range();
    hdr.cal_min = min as f32;
    hdr.cal_max = max as f32;
    Ok(hdr)
}


/// Encode all voxels of `volume` to `output`, one chunk at a time.
fn write_voxels<V: VolumeArray, W: Write>(volume: &V, output: &mut W, endianness: Endianness, chunk_bytes: usize) -> Result<()> {
    let kind = volume.storage_type();
    let total = volume.extents().num_voxels();
    let per_chunk = (chunk_bytes / kind.encoded_size()).max(1);
    let mut start = 0;
    while start < total {
        let n = per_chunk.min(total - start);
        let mut chunk = VoxelBuffer::zeros(kind, n);
        for i in 0..n {
            if kind.is_integer() {
                chunk.set_i64(i, volume.raw_i64(start + i));
            } else {
                chunk.set_f64(i, volume.raw_f64(start + i));
            }
        }
        chunk.write_to(output, endianness, chunk_bytes)?;
        start += n;
    }
    Ok(())
}


/// Create `path` and hand a writer for it to `body`, compressing if `gz` is set.
fn with_writer<F>(path: &Path, gz: bool, body: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let mut file = BufWriter::new(File::create(path)?);
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        body(&mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        body(&mut file)?;
        file.flush()?;
    }
    Ok(())
}


/// Where and how a volume is written, derived from the destination name.
fn output_layout(path: &Path) -> (PathBuf, PathBuf) {
    let (stem, suffix) = split_known_suffix(path);
    match suffix {
        Some(".nii") | Some(".nii.gz") => (path.to_path_buf(), path.to_path_buf()),
        Some(".img.gz") => (path_with_suffix(&stem, ".hdr"), path.to_path_buf()),
        Some(".hdr") | Some(".img") => (path_with_suffix(&stem, ".hdr"), path_with_suffix(&stem, ".img")),
        _ => {
            let file = path_with_suffix(&stem, ".nii");
            (file.clone(), file)
        }
    }
}


/// Write a volume as NIFTI-1.
///
/// A name ending in `.nii` or `.nii.gz` gives a single file, `.hdr`, `.img` or
/// `.img.gz` a header and image pair. Any other name gets `.nii` appended.
pub fn write_volume<P: AsRef<Path>, V: VolumeArray>(path: P, volume: &V, options: &WriteOptions) -> Result<()> {
    let (header_path, image_path) = output_layout(path.as_ref());
    let single_file = header_path == image_path;
    let hdr = header_from_volume(volume, options, single_file)?;
    debug!("Writing {:?} volume to '{}'.", hdr.format(), image_path.display());

    if single_file {
        with_writer(&image_path, is_gz_file(&image_path), |mut output| {
            hdr.write_to(&mut output, &options.extensions)?;
            write_voxels(volume, &mut output, options.endianness, options.chunk_bytes)
        })
    } else {
        with_writer(&header_path, false, |mut output| hdr.write_to(&mut output, &options.extensions))?;
        with_writer(&image_path, is_gz_file(&image_path), |mut output| {
            write_voxels(volume, &mut output, options.endianness, options.chunk_bytes)
        })
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stems_are_split_from_known_suffixes() {
        assert_eq!((PathBuf::from("/d/brain"), Some(".nii.gz")), split_known_suffix(Path::new("/d/brain.nii.gz")));
        assert_eq!((PathBuf::from("/d/brain"), Some(".atlas.xml")), split_known_suffix(Path::new("/d/brain.atlas.xml")));
        assert_eq!((PathBuf::from("/d/brain.v1"), None), split_known_suffix(Path::new("/d/brain.v1")));
    }

    #[test]
    fn output_layout_follows_the_name() {
        assert_eq!((PathBuf::from("a.nii"), PathBuf::from("a.nii")), output_layout(Path::new("a.nii")));
        assert_eq!((PathBuf::from("a.hdr"), PathBuf::from("a.img")), output_layout(Path::new("a.img")));
        assert_eq!((PathBuf::from("a.hdr"), PathBuf::from("a.img.gz")), output_layout(Path::new("a.img.gz")));
        assert_eq!((PathBuf::from("a.nii"), PathBuf::from("a.nii")), output_layout(Path::new("a")));
    }

    #[test]
    fn default_options() {
        let read = ReadOptions::default();
        assert!(read.spm);
        assert!(read.prefer_standard_space);
        assert_eq!(1 << 20, read.chunk_bytes);
        let write = WriteOptions::default();
        assert_eq!(Endianness::Big, write.endianness);
        assert_eq!(1, write.sform_code);
    }
}
