//! Rust implementation of the NIFTI-1, Analyze 7.5 and SPM volume file formats.
//!
//! Headers are decoded into [`VolumeHeader`], their index-to-space transform is
//! resolved into an [`AffineTransform`], and the voxels are held by an
//! [`IndexedVolume`] that supports nearest neighbor and trilinear sampling in voxel
//! and physical space.

pub mod error;
pub mod matfile;
pub mod nifti_header;
pub mod nifti_transform;
pub mod storage;
pub mod traits;
pub mod util;
pub mod volume;
pub mod volume_file;

pub use error::{NeurovolError, Result};
pub use matfile::MatFile;
pub use nifti_header::{detect_endianness, AnalyzeHistory, HeaderFormat, NiftiExtension, VolumeHeader};
pub use nifti_transform::{resolve_transform, AffineTransform, MatrixSource, ResolvedTransform, TransformMethod};
pub use storage::{StorageKind, VoxelBuffer};
pub use traits::{Rgb24, Voxel};
pub use volume::{
    Extents, IndexedVolume, Interpolation, LineDirection, MappedVolume, MirroredVolume, Region, VolumeArray,
    VolumeGeometry,
};
pub use volume_file::{
    header_from_volume, read_volume, write_volume, CompanionFiles, ReadOptions, VolumeFile, WriteOptions,
};
