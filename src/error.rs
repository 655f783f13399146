use quick_error::quick_error;
use std::io::Error as IOError;
use std::path::PathBuf;

quick_error! {
    /// Error type for all error variants originated by this crate.
    #[derive(Debug)]
    pub enum NeurovolError {
        /// The `sizeof_hdr` field is not 348.
        InvalidHeaderSize(size: i32) {
            display("Invalid header: sizeof_hdr is {}, expected 348", size)
        }

        /// Neither byte order yields a rank (`dim[0]`, offset 40) in [1, 7].
        BadByteOrder {
            display("Invalid header: cannot determine byte order from dim[0] at offset 40")
        }

        /// The header ended before the named field could be read.
        TruncatedHeader(field: &'static str, offset: usize) {
            display("Truncated header: field '{}' at byte offset {} is missing", field, offset)
        }

        /// The voxel stream ended early.
        TruncatedImage(expected: usize, actual: usize) {
            display("Truncated image data: expected {} voxels, got {}", expected, actual)
        }

        /// `vox_offset` cannot be written as a byte offset.
        InvalidVoxOffset(offset: f32) {
            display("Invalid vox_offset {}", offset)
        }

        /// A NIFTI extension record is malformed.
        InvalidExtension(offset: usize) {
            display("Invalid NIFTI extension record at byte offset {}", offset)
        }

        /// The datatype code has no storage mapping.
        UnsupportedDatatype(code: i16) {
            display("Unsupported datatype code {}", code)
        }

        /// An external matrix exists but is not usable as an index-to-space transform.
        UnsupportedMatrix(reason: String) {
            display("Unsupported matrix: {}", reason)
        }

        /// A voxel coordinate lies outside the volume extents.
        IndexOutOfRange(x: i64, y: i64, z: i64, t: i64, i5: i64) {
            display("Voxel ({}, {}, {}, {}, {}) is out of range", x, y, z, t, i5)
        }

        /// A region does not fit inside the volume extents.
        RegionOutOfRange {
            display("Region exceeds the volume extents")
        }

        /// A value buffer does not match the number of voxels it should hold.
        DataLengthMismatch(expected: usize, actual: usize) {
            display("Expected {} values, got {}", expected, actual)
        }

        /// A required companion file was not found.
        MissingCompanion(path: PathBuf) {
            display("Missing companion file {}", path.display())
        }

        /// The external matrix file could not be decoded.
        InvalidMatFile(reason: String) {
            display("Invalid MAT file: {}", reason)
        }

        /// Write attempted on a view that does not support it.
        ReadOnlyVolume {
            display("Volume is read-only")
        }

        /// The index-to-space transform cannot be inverted.
        SingularTransform {
            display("Index-to-space transform is singular")
        }

        /// At least one extent of a volume is zero.
        EmptyExtents {
            display("Volume extents must all be at least 1")
        }

        /// The product of the extents does not fit a `usize`.
        TooManyVoxels {
            display("Volume extents are too large to address")
        }

        /// An extent does not fit the 16 bit `dim` header field.
        ExtentTooLarge(extent: usize) {
            display("Extent {} does not fit the 16 bit dim field", extent)
        }

        /// I/O Error
        Io(err: IOError) {
            from()
            source(err)
        }

        /// ndarray shape error
        Shape(err: ndarray::ShapeError) {
            from()
            source(err)
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, NeurovolError>;
