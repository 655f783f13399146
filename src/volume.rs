//! The sampling engine: 5-D voxel grids addressed by index or by physical position.
//!
//! A volume has extents `(x, y, z, t, i5)`, stored with x varying fastest, and an
//! affine transform mapping voxel indices to millimeters. `VolumeArray` provides
//! addressing, interpolation, line and plane extraction and region transfer on top of
//! a handful of raw accessors. `IndexedVolume` owns a typed buffer, `MirroredVolume`
//! and `MappedVolume` are views onto another volume.

use ndarray::{Array2, Array5, ShapeBuilder};

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{NeurovolError, Result};
use crate::nifti_transform::AffineTransform;
use crate::storage::{StorageKind, VoxelBuffer};

/// Distance to a lattice coordinate below which the neighbouring voxel is not fetched.
pub const INTERPOLATION_EPSILON: f64 = 0.005;

/// The size of a volume along its five axes. All extents are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extents {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub t: usize,
    pub i5: usize,
}

impl Extents {
    pub fn new(x: usize, y: usize, z: usize, t: usize, i5: usize) -> Extents {
        Extents { x, y, z, t, i5 }
    }

    /// Extents from a header `dim` field. Axes beyond the rank `dim[0]`, and axes
    /// with a non-positive length, get extent 1.
    pub fn from_dims(dim: &[i16; 8]) -> Extents {
        let axis = |a: usize| -> usize {
            if dim[0] as usize >= a && dim[a] > 0 { dim[a] as usize } else { 1 }
        };
        Extents::new(axis(1), axis(2), axis(3), axis(4), axis(5))
    }

    pub fn as_array(&self) -> [usize; 5] {
        [self.x, self.y, self.z, self.t, self.i5]
    }

    /// # Panics
    ///
    /// If the product overflows. Extents held by a `VolumeGeometry` never do.
    pub fn num_voxels(&self) -> usize {
        self.x * self.y * self.z * self.t * self.i5
    }

    /// The number of voxels, `None` if it does not fit a `usize`.
    pub fn checked_num_voxels(&self) -> Option<usize> {
        self.as_array().iter().try_fold(1usize, |acc, e| acc.checked_mul(*e))
    }
}


/// Extents plus the index-to-space transform and its inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    extents: Extents,
    index_to_space: AffineTransform,
    space_to_index: AffineTransform,
    strides: [usize; 5],
}

impl VolumeGeometry {
    pub fn new(extents: Extents, index_to_space: AffineTransform) -> Result<VolumeGeometry> {
        if extents.as_array().contains(&0) {
            return Err(NeurovolError::EmptyExtents);
        }
        extents.checked_num_voxels().ok_or(NeurovolError::TooManyVoxels)?;
        let space_to_index = index_to_space.inverse().ok_or(NeurovolError::SingularTransform)?;
        let strides = [
            1,
            extents.x,
            extents.x * extents.y,
            extents.x * extents.y * extents.z,
            extents.x * extents.y * extents.z * extents.t,
        ];
        Ok(VolumeGeometry { extents, index_to_space, space_to_index, strides })
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    pub fn index_to_space(&self) -> &AffineTransform {
        &self.index_to_space
    }

    pub fn space_to_index(&self) -> &AffineTransform {
        &self.space_to_index
    }

    /// Index step for a unit step along each axis.
    pub fn strides(&self) -> [usize; 5] {
        self.strides
    }

    /// The linear index of a voxel, `None` if any coordinate is outside the extents.
    pub fn index(&self, x: i64, y: i64, z: i64, t: i64, i5: i64) -> Option<usize> {
        let coords = [x, y, z, t, i5];
        let extents = self.extents.as_array();
        let mut index = 0;
        for axis in 0..5 {
            if coords[axis] < 0 || coords[axis] as usize >= extents[axis] {
                return None;
            }
            index += coords[axis] as usize * self.strides[axis];
        }
        Some(index)
    }

    /// The voxel coordinates of a linear index, `None` past the last voxel.
    pub fn coords_of(&self, index: usize) -> Option<[usize; 5]> {
        if index >= self.extents.num_voxels() {
            return None;
        }
        let mut rest = index;
        let mut coords = [0; 5];
        for axis in (0..5).rev() {
            coords[axis] = rest / self.strides[axis];
            rest %= self.strides[axis];
        }
        Some(coords)
    }

    fn linear(&self, x: usize, y: usize, z: usize, t: usize, i5: usize) -> usize {
        x + y * self.strides[1] + z * self.strides[2] + t * self.strides[3] + i5 * self.strides[4]
    }
}


/// How to sample between lattice points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbor,
    Trilinear,
}

/// Classification of a line segment relative to the voxel axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirection {
    XPlus,
    XMinus,
    YPlus,
    YMinus,
    ZPlus,
    ZMinus,
    /// Oblique, or a degenerate segment.
    None,
}

/// An axis aligned box of voxels, as start and size along `(x, y, z, t, i5)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub origin: [usize; 5],
    pub size: [usize; 5],
}

impl Region {
    pub fn new(origin: [usize; 5], size: [usize; 5]) -> Region {
        Region { origin, size }
    }

    /// The whole volume.
    pub fn of(extents: Extents) -> Region {
        Region::new([0; 5], extents.as_array())
    }

    pub fn num_voxels(&self) -> usize {
        self.size.iter().product()
    }

    fn check(&self, extents: Extents) -> Result<()> {
        let max = extents.as_array();
        for axis in 0..5 {
            if self.origin[axis].checked_add(self.size[axis]).map_or(true, |end| end > max[axis]) {
                return Err(NeurovolError::RegionOutOfRange);
            }
        }
        Ok(())
    }

    /// Linear indices of the region in `(i5, t, z, y, x)` nesting, x innermost.
    fn indices<'a>(&'a self, geometry: &'a VolumeGeometry) -> impl Iterator<Item = usize> + 'a {
        let [ox, oy, oz, ot, oi5] = self.origin;
        let [sx, sy, sz, st, si5] = self.size;
        (oi5..oi5 + si5).flat_map(move |i5| {
            (ot..ot + st).flat_map(move |t| {
                (oz..oz + sz).flat_map(move |z| {
                    (oy..oy + sy).flat_map(move |y| {
                        (ox..ox + sx).map(move |x| geometry.linear(x, y, z, t, i5))
                    })
                })
            })
        })
    }
}


/// Lower lattice coordinate and fraction of `v` along an axis of length `max`,
/// `None` outside `[-eps, max - 1 + eps]`. The upper border yields fraction 0.
fn lattice_cell(v: f64, max: usize) -> Option<(usize, f64)> {
    let last = (max - 1) as f64;
    if !(v >= -INTERPOLATION_EPSILON && v <= last + INTERPOLATION_EPSILON) {
        return None;
    }
    let v = v.max(0.).min(last);
    let i = v.floor() as usize;
    Some((i, v - i as f64))
}


fn blend(c: &[f64; 8], dx: f64, dy: f64, dz: f64) -> f64 {
    c[0] * (1. - dx) * (1. - dy) * (1. - dz)
        + c[1] * dx * (1. - dy) * (1. - dz)
        + c[2] * (1. - dx) * dy * (1. - dz)
        + c[3] * dx * dy * (1. - dz)
        + c[4] * (1. - dx) * (1. - dy) * dz
        + c[5] * dx * (1. - dy) * dz
        + c[6] * (1. - dx) * dy * dz
        + c[7] * dx * dy * dz
}


fn round_half_up(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}


/// A 5-D voxel grid with an index-to-space transform.
///
/// Implementors provide the geometry and raw access by linear index, everything else
/// is built on top. Raw values are the storage values widened to `f64` or `i64`,
/// with unsigned kinds reporting their unsigned magnitude.
pub trait VolumeArray {
    fn geometry(&self) -> &VolumeGeometry;

    /// The kind the voxels are stored as.
    fn storage_type(&self) -> StorageKind;

    /// The kind used for arithmetic on voxel values.
    fn natural_type(&self) -> StorageKind {
        self.storage_type().natural()
    }

    /// # Panics
    ///
    /// If `index` is not below the number of voxels.
    fn raw_f64(&self, index: usize) -> f64;

    /// # Panics
    ///
    /// If `index` is not below the number of voxels.
    fn raw_i64(&self, index: usize) -> i64;

    fn set_raw_f64(&mut self, index: usize, value: f64) -> Result<()>;

    fn set_raw_i64(&mut self, index: usize, value: i64) -> Result<()>;

    /// The smallest and largest voxel value, as computed when the volume was built.
    fn image_range(&self) -> (f64, f64);

    fn extents(&self) -> Extents {
        self.geometry().extents()
    }

    fn index(&self, x: i64, y: i64, z: i64, t: i64, i5: i64) -> Option<usize> {
        self.geometry().index(x, y, z, t, i5)
    }

    fn coords_of(&self, index: usize) -> Option<[usize; 5]> {
        self.geometry().coords_of(index)
    }

    fn value(&self, x: i64, y: i64, z: i64, t: i64, i5: i64) -> Result<f64> {
        self.index(x, y, z, t, i5)
            .map(|idx| self.raw_f64(idx))
            .ok_or(NeurovolError::IndexOutOfRange(x, y, z, t, i5))
    }

    fn value_i64(&self, x: i64, y: i64, z: i64, t: i64, i5: i64) -> Result<i64> {
        self.index(x, y, z, t, i5)
            .map(|idx| self.raw_i64(idx))
            .ok_or(NeurovolError::IndexOutOfRange(x, y, z, t, i5))
    }

    fn set_value(&mut self, x: i64, y: i64, z: i64, t: i64, i5: i64, value: f64) -> Result<()> {
        let idx = self.index(x, y, z, t, i5).ok_or(NeurovolError::IndexOutOfRange(x, y, z, t, i5))?;
        self.set_raw_f64(idx, value)
    }

    fn set_value_i64(&mut self, x: i64, y: i64, z: i64, t: i64, i5: i64, value: i64) -> Result<()> {
        let idx = self.index(x, y, z, t, i5).ok_or(NeurovolError::IndexOutOfRange(x, y, z, t, i5))?;
        self.set_raw_i64(idx, value)
    }

    /// Trilinear interpolation at a fractional voxel position.
    ///
    /// Positions within `INTERPOLATION_EPSILON` of the volume are clamped onto it, positions
    /// further out yield 0. A neighbour closer than the epsilon along an axis is not
    /// fetched, the lower corner is reused, so lattice points return their stored value
    /// exactly. RGB volumes are blended per channel.
    fn interpolate_trilinear(&self, x: f64, y: f64, z: f64, t: usize, i5: usize) -> f64 {
        let geometry = self.geometry();
        let ext = geometry.extents();
        if t >= ext.t || i5 >= ext.i5 {
            return 0.;
        }
        let (i, dx) = match lattice_cell(x, ext.x) { Some(c) => c, None => return 0. };
        let (j, dy) = match lattice_cell(y, ext.y) { Some(c) => c, None => return 0. };
        let (k, dz) = match lattice_cell(z, ext.z) { Some(c) => c, None => return 0. };

        let strides = geometry.strides();
        let step_x = if dx < INTERPOLATION_EPSILON { 0 } else { strides[0] };
        let step_y = if dy < INTERPOLATION_EPSILON { 0 } else { strides[1] };
        let step_z = if dz < INTERPOLATION_EPSILON { 0 } else { strides[2] };
        let base = geometry.linear(i, j, k, t, i5);
        let mut corners = [0usize; 8];
        for (bits, c) in corners.iter_mut().enumerate() {
            *c = base
                + if bits & 1 != 0 { step_x } else { 0 }
                + if bits & 2 != 0 { step_y } else { 0 }
                + if bits & 4 != 0 { step_z } else { 0 };
        }

        if self.natural_type() == StorageKind::Rgb24 {
            let mut rgb: i64 = 0xff00_0000;
            for &shift in &[16, 8, 0] {
                let mut channel = [0.; 8];
                for (v, idx) in channel.iter_mut().zip(&corners) {
                    *v = ((self.raw_i64(*idx) >> shift) & 0xff) as f64;
                }
                let blended = round_half_up(blend(&channel, dx, dy, dz)).max(0).min(0xff);
                rgb |= blended << shift;
            }
            return rgb as f64;
        }

        let mut values = [0.; 8];
        for (v, idx) in values.iter_mut().zip(&corners) {
            *v = self.raw_f64(*idx);
        }
        blend(&values, dx, dy, dz)
    }

    /// The value of the voxel nearest to a fractional voxel position, rounding half up. 0 outside the volume.
    fn sample_nearest(&self, x: f64, y: f64, z: f64, t: usize, i5: usize) -> f64 {
        self.index(round_half_up(x), round_half_up(y), round_half_up(z), t as i64, i5 as i64)
            .map(|idx| self.raw_f64(idx))
            .unwrap_or(0.)
    }

    /// Sample at a fractional voxel position.
    fn sample_voxel_space(&self, p: [f64; 3], t: usize, i5: usize, interpolation: Interpolation) -> f64 {
        match interpolation {
            Interpolation::NearestNeighbor => self.sample_nearest(p[0], p[1], p[2], t, i5),
            Interpolation::Trilinear => self.interpolate_trilinear(p[0], p[1], p[2], t, i5),
        }
    }

    /// Sample at a point in physical space. A volume with a single time point answers every `t`.
    fn sample_at_point(&self, point: [f64; 3], t: usize, i5: usize, interpolation: Interpolation) -> f64 {
        let t = if self.extents().t == 1 { 0 } else { t };
        let p = self.geometry().space_to_index().apply(point);
        self.sample_voxel_space(p, t, i5, interpolation)
    }

    /// `n` evenly spaced samples from `p1` towards `p2`, both in physical space.
    /// The first sample is at `p1`, the last one a step short of `p2`.
    fn line(&self, p1: [f64; 3], p2: [f64; 3], t: usize, i5: usize, n: usize, interpolation: Interpolation) -> Vec<f64> {
        let to_index = self.geometry().space_to_index();
        let start = to_index.apply(p1);
        let end = to_index.apply(p2);
        let mut step = [0.; 3];
        for axis in 0..3 {
            step[axis] = (end[axis] - start[axis]) / n.max(1) as f64;
        }
        (0..n)
            .map(|s| {
                let s = s as f64;
                let p = [start[0] + s * step[0], start[1] + s * step[1], start[2] + s * step[2]];
                self.sample_voxel_space(p, t, i5, interpolation)
            })
            .collect()
    }

    /// Whether the segment from `p1` to `p2` runs along one voxel axis, and in which sense.
    fn line_direction(&self, p1: [f64; 3], p2: [f64; 3]) -> LineDirection {
        let to_index = self.geometry().space_to_index();
        let a = to_index.apply(p1);
        let b = to_index.apply(p2);
        let same = |axis: usize| (a[axis] - b[axis]).abs() < 1e-9;
        match (same(0), same(1), same(2)) {
            (true, true, false) => if a[2] < b[2] { LineDirection::ZPlus } else { LineDirection::ZMinus },
            (true, false, true) => if a[1] < b[1] { LineDirection::YPlus } else { LineDirection::YMinus },
            (false, true, true) => if a[0] < b[0] { LineDirection::XPlus } else { LineDirection::XMinus },
            _ => LineDirection::None,
        }
    }

    /// Sample a plane in physical space into a `height` x `width` raster.
    /// Pixel `(row, col)` is taken at `origin + col * right + row * down`.
    fn raster(&self, origin: [f64; 3], right: [f64; 3], down: [f64; 3], width: usize, height: usize,
              t: usize, i5: usize, interpolation: Interpolation) -> Array2<f64> {
        Array2::from_shape_fn((height, width), |(row, col)| {
            let (r, c) = (row as f64, col as f64);
            let p = [
                origin[0] + c * right[0] + r * down[0],
                origin[1] + c * right[1] + r * down[1],
                origin[2] + c * right[2] + r * down[2],
            ];
            self.sample_at_point(p, t, i5, interpolation)
        })
    }

    /// The values of a region, x varying fastest.
    fn read_region(&self, region: &Region) -> Result<Vec<f64>> {
        region.check(self.extents())?;
        Ok(region.indices(self.geometry()).map(|idx| self.raw_f64(idx)).collect())
    }

    fn read_region_i64(&self, region: &Region) -> Result<Vec<i64>> {
        region.check(self.extents())?;
        Ok(region.indices(self.geometry()).map(|idx| self.raw_i64(idx)).collect())
    }

    /// Overwrite a region with values ordered x fastest.
    fn write_region(&mut self, region: &Region, values: &[f64]) -> Result<()> {
        region.check(self.extents())?;
        if values.len() != region.num_voxels() {
            return Err(NeurovolError::DataLengthMismatch(region.num_voxels(), values.len()));
        }
        let indices: Vec<usize> = region.indices(self.geometry()).collect();
        for (idx, v) in indices.into_iter().zip(values) {
            self.set_raw_f64(idx, *v)?;
        }
        Ok(())
    }

    fn write_region_i64(&mut self, region: &Region, values: &[i64]) -> Result<()> {
        region.check(self.extents())?;
        if values.len() != region.num_voxels() {
            return Err(NeurovolError::DataLengthMismatch(region.num_voxels(), values.len()));
        }
        let indices: Vec<usize> = region.indices(self.geometry()).collect();
        for (idx, v) in indices.into_iter().zip(values) {
            self.set_raw_i64(idx, *v)?;
        }
        Ok(())
    }

    /// Millimeters per voxel step along x, y and z.
    fn voxel_size(&self) -> [f64; 3] {
        self.geometry().index_to_space().voxel_size()
    }

    /// Scan all voxels for the smallest and largest value, skipping NaN. RGB volumes report `(0, 0)`.
    fn compute_range(&self) -> (f64, f64) {
        if self.natural_type() == StorageKind::Rgb24 {
            return (0., 0.);
        }
        (0..self.extents().num_voxels())
            .map(|idx| self.raw_f64(idx))
            .filter(|v| !v.is_nan())
            .fold(None, |range: Option<(f64, f64)>, v| match range {
                Some((min, max)) => Some((min.min(v), max.max(v))),
                None => Some((v, v)),
            })
            .unwrap_or((f64::NAN, f64::NAN))
    }

    fn to_vec_f64(&self) -> Vec<f64> {
        (0..self.extents().num_voxels()).map(|idx| self.raw_f64(idx)).collect()
    }

    /// All voxels as an array indexed `[x, y, z, t, i5]`, in column-major layout.
    fn to_ndarray(&self) -> Result<Array5<f64>> {
        let e = self.extents();
        Ok(Array5::from_shape_vec((e.x, e.y, e.z, e.t, e.i5).f(), self.to_vec_f64())?)
    }

    /// A read-only view applying `f` to every sampled value.
    fn map_with<F>(&self, f: F) -> MappedVolume<'_, Self, F>
    where
        Self: Sized,
        F: Fn(f64) -> f64,
    {
        MappedVolume::new(self, f)
    }
}


/// A volume owning a typed voxel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedVolume {
    geometry: VolumeGeometry,
    data: VoxelBuffer,
    image_range: (f64, f64),
}

impl IndexedVolume {
    /// Wrap a buffer holding exactly one value per voxel, x varying fastest.
    pub fn new(extents: Extents, index_to_space: AffineTransform, data: VoxelBuffer) -> Result<IndexedVolume> {
        let geometry = VolumeGeometry::new(extents, index_to_space)?;
        if data.len() != extents.num_voxels() {
            return Err(NeurovolError::DataLengthMismatch(extents.num_voxels(), data.len()));
        }
        let mut volume = IndexedVolume { geometry, data, image_range: (0., 0.) };
        volume.refresh_image_range();
        Ok(volume)
    }

    /// A zero filled volume of the given storage kind.
    pub fn zeros(extents: Extents, index_to_space: AffineTransform, kind: StorageKind) -> Result<IndexedVolume> {
        let count = extents.checked_num_voxels().ok_or(NeurovolError::TooManyVoxels)?;
        IndexedVolume::new(extents, index_to_space, VoxelBuffer::zeros(kind, count))
    }

    pub fn data(&self) -> &VoxelBuffer {
        &self.data
    }

    pub fn into_data(self) -> VoxelBuffer {
        self.data
    }

    /// Recompute the image range, e.g. after writing voxels.
    pub fn refresh_image_range(&mut self) {
        self.image_range = self.compute_range();
    }
}

impl VolumeArray for IndexedVolume {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn storage_type(&self) -> StorageKind {
        self.data.kind()
    }

    fn raw_f64(&self, index: usize) -> f64 {
        self.data.get_f64(index)
    }

    fn raw_i64(&self, index: usize) -> i64 {
        self.data.get_i64(index)
    }

    fn set_raw_f64(&mut self, index: usize, value: f64) -> Result<()> {
        self.data.set_f64(index, value);
        Ok(())
    }

    fn set_raw_i64(&mut self, index: usize, value: i64) -> Result<()> {
        self.data.set_i64(index, value);
        Ok(())
    }

    fn image_range(&self) -> (f64, f64) {
        self.image_range
    }
}


/// A view doubling the x extent of a backing volume: the second half of every row
/// mirrors the first. Writes go through to the backing volume, and the image range
/// is the one the backing volume currently reports.
#[derive(Debug)]
pub struct MirroredVolume<V: VolumeArray> {
    geometry: VolumeGeometry,
    backing: Rc<RefCell<V>>,
}

impl<V: VolumeArray> MirroredVolume<V> {
    pub fn new(backing: Rc<RefCell<V>>) -> Result<MirroredVolume<V>> {
        let geometry = {
            let inner = backing.borrow();
            let mut extents = inner.extents();
            extents.x = extents.x.checked_mul(2).ok_or(NeurovolError::TooManyVoxels)?;
            VolumeGeometry::new(extents, *inner.geometry().index_to_space())?
        };
        Ok(MirroredVolume { geometry, backing })
    }

    pub fn backing(&self) -> &Rc<RefCell<V>> {
        &self.backing
    }

    /// The index in the backing volume that a mirrored index reads from.
    fn backing_index(&self, index: usize) -> usize {
        let width = self.geometry.extents().x;
        let half = width / 2;
        let offset = index % width;
        let row_start = (index - offset) / 2;
        if offset < half { row_start + offset } else { row_start + (width - offset - 1) }
    }
}

impl<V: VolumeArray> VolumeArray for MirroredVolume<V> {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn storage_type(&self) -> StorageKind {
        self.backing.borrow().storage_type()
    }

    fn natural_type(&self) -> StorageKind {
        self.backing.borrow().natural_type()
    }

    fn raw_f64(&self, index: usize) -> f64 {
        self.backing.borrow().raw_f64(self.backing_index(index))
    }

    fn raw_i64(&self, index: usize) -> i64 {
        self.backing.borrow().raw_i64(self.backing_index(index))
    }

    fn set_raw_f64(&mut self, index: usize, value: f64) -> Result<()> {
        let idx = self.backing_index(index);
        self.backing.borrow_mut().set_raw_f64(idx, value)
    }

    fn set_raw_i64(&mut self, index: usize, value: i64) -> Result<()> {
        let idx = self.backing_index(index);
        self.backing.borrow_mut().set_raw_i64(idx, value)
    }

    fn image_range(&self) -> (f64, f64) {
        self.backing.borrow().image_range()
    }
}


/// A read-only view applying a function to every value of another volume.
/// Integer reads round the mapped value. The storage and natural types are those of
/// the inner volume, so a mapped RGB volume still interpolates per channel.
pub struct MappedVolume<'a, V: VolumeArray, F> {
    inner: &'a V,
    f: F,
    image_range: (f64, f64),
}

impl<'a, V: VolumeArray, F: Fn(f64) -> f64> MappedVolume<'a, V, F> {
    pub fn new(inner: &'a V, f: F) -> MappedVolume<'a, V, F> {
        let mut mapped = MappedVolume { inner, f, image_range: (0., 0.) };
        mapped.image_range = mapped.compute_range();
        mapped
    }
}

impl<'a, V: VolumeArray, F: Fn(f64) -> f64> VolumeArray for MappedVolume<'a, V, F> {
    fn geometry(&self) -> &VolumeGeometry {
        self.inner.geometry()
    }

    fn storage_type(&self) -> StorageKind {
        self.inner.storage_type()
    }

    fn natural_type(&self) -> StorageKind {
        self.inner.natural_type()
    }

    fn raw_f64(&self, index: usize) -> f64 {
        (self.f)(self.inner.raw_f64(index))
    }

    fn raw_i64(&self, index: usize) -> i64 {
        self.raw_f64(index).round() as i64
    }

    fn set_raw_f64(&mut self, _index: usize, _value: f64) -> Result<()> {
        Err(NeurovolError::ReadOnlyVolume)
    }

    fn set_raw_i64(&mut self, _index: usize, _value: i64) -> Result<()> {
        Err(NeurovolError::ReadOnlyVolume)
    }

    fn image_range(&self) -> (f64, f64) {
        self.image_range
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::traits::Rgb24;
    use approx::assert_abs_diff_eq;

    /// A float volume whose value is a linear function of the voxel position.
    fn ramp_volume(extents: Extents) -> IndexedVolume {
        let values: Vec<f64> = (0..extents.num_voxels())
            .map(|idx| {
                let x = idx % extents.x;
                let y = (idx / extents.x) % extents.y;
                let z = (idx / (extents.x * extents.y)) % extents.z;
                (x + 10 * y + 100 * z) as f64
            })
            .collect();
        IndexedVolume::new(extents, AffineTransform::identity(), VoxelBuffer::Float64(values)).unwrap()
    }

    #[test]
    fn extents_follow_the_rank() {
        assert_eq!(Extents::new(4, 5, 6, 1, 1), Extents::from_dims(&[3, 4, 5, 6, 7, 8, 1, 1]));
        assert_eq!(Extents::new(4, 5, 1, 7, 1), Extents::from_dims(&[4, 4, 5, 0, 7, 8, 1, 1]));
    }

    #[test]
    fn index_is_a_bijection_onto_the_voxels() {
        let geometry = VolumeGeometry::new(Extents::new(2, 3, 4, 2, 3), AffineTransform::identity()).unwrap();
        let mut expected = 0;
        for i5 in 0..3 {
            for t in 0..2 {
                for z in 0..4 {
                    for y in 0..3 {
                        for x in 0..2 {
                            let idx = geometry.index(x, y, z, t, i5).unwrap();
                            assert_eq!(expected, idx);
                            assert_eq!([x as usize, y as usize, z as usize, t as usize, i5 as usize], geometry.coords_of(idx).unwrap());
                            expected += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(None, geometry.coords_of(expected));
        assert_eq!([1, 2, 6, 24, 48], geometry.strides());
    }

    #[test]
    fn out_of_range_coordinates_have_no_index() {
        let volume = ramp_volume(Extents::new(3, 3, 3, 1, 1));
        assert_eq!(None, volume.index(3, 0, 0, 0, 0));
        assert_eq!(None, volume.index(0, -1, 0, 0, 0));
        assert_eq!(None, volume.index(0, 0, 0, 1, 0));
        assert!(matches!(volume.value(0, 0, 5, 0, 0), Err(NeurovolError::IndexOutOfRange(0, 0, 5, 0, 0))));
    }

    #[test]
    fn empty_extents_and_singular_transforms_are_rejected() {
        assert!(matches!(VolumeGeometry::new(Extents::new(0, 1, 1, 1, 1), AffineTransform::identity()), Err(NeurovolError::EmptyExtents)));
        let flat = AffineTransform::from_scale_translation([1., 1., 0.], [0.; 3]);
        assert!(matches!(VolumeGeometry::new(Extents::new(1, 1, 1, 1, 1), flat), Err(NeurovolError::SingularTransform)));
    }

    #[test]
    fn buffer_length_must_match_the_extents() {
        let res = IndexedVolume::new(Extents::new(2, 2, 2, 1, 1), AffineTransform::identity(), VoxelBuffer::Int16(vec![0; 7]));
        assert!(matches!(res, Err(NeurovolError::DataLengthMismatch(8, 7))));
    }

    #[test]
    fn trilinear_is_exact_on_lattice_points() {
        let extents = Extents::new(4, 3, 2, 1, 1);
        let values: Vec<f32> = (0..24).map(|v| (v as f32 * 1.37).sin()).collect();
        let volume = IndexedVolume::new(extents, AffineTransform::identity(), VoxelBuffer::Float32(values)).unwrap();
        for z in 0..2 {
            for y in 0..3 {
                for x in 0..4 {
                    let idx = volume.index(x, y, z, 0, 0).unwrap();
                    assert_eq!(volume.raw_f64(idx), volume.interpolate_trilinear(x as f64, y as f64, z as f64, 0, 0));
                }
            }
        }
    }

    #[test]
    fn trilinear_reproduces_linear_ramps() {
        let volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        assert_abs_diff_eq!(0.5 + 12.5 + 75., volume.interpolate_trilinear(0.5, 1.25, 0.75, 0, 0), epsilon = 1e-9);
        assert_abs_diff_eq!(2.9 + 30. + 300., volume.interpolate_trilinear(2.9, 3., 3., 0, 0), epsilon = 1e-9);
    }

    #[test]
    fn trilinear_tolerates_the_border_and_is_zero_outside() {
        let volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        assert_eq!(333., volume.interpolate_trilinear(3.004, 3., 3., 0, 0));
        assert_eq!(110., volume.interpolate_trilinear(-0.003, 1., 1., 0, 0));
        assert_eq!(0., volume.interpolate_trilinear(3.2, 3., 3., 0, 0));
        assert_eq!(0., volume.interpolate_trilinear(-0.5, 1., 1., 0, 0));
        assert_eq!(0., volume.interpolate_trilinear(1., 1., 1., 1, 0));
        assert_eq!(0., volume.interpolate_trilinear(f64::NAN, 1., 1., 0, 0));
    }

    #[test]
    fn rgb_is_interpolated_per_channel() {
        let data = VoxelBuffer::Rgb24(vec![Rgb24::new(0, 0, 0), Rgb24::new(200, 100, 50)]);
        let volume = IndexedVolume::new(Extents::new(2, 1, 1, 1, 1), AffineTransform::identity(), data).unwrap();
        let mid = Rgb24(volume.interpolate_trilinear(0.5, 0., 0., 0, 0) as u32);
        assert_eq!((100, 50, 25), (mid.r(), mid.g(), mid.b()));
        assert_eq!((0., 0.), volume.image_range());
    }

    #[test]
    fn nearest_neighbour_rounds_half_up() {
        let volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        assert_eq!(1., volume.sample_nearest(0.5, 0., 0., 0, 0));
        assert_eq!(0., volume.sample_nearest(0.49, 0., 0., 0, 0));
        assert_eq!(0., volume.sample_nearest(3.5, 0., 0., 0, 0));
        assert_eq!(10., volume.sample_nearest(-0.4, 0.6, 0., 0, 0));
    }

    #[test]
    fn physical_points_go_through_the_inverse_transform() {
        let transform = AffineTransform::from_scale_translation([2., 2., 2.], [-2., -2., -2.]);
        let extents = Extents::new(4, 4, 4, 1, 1);
        let mut volume = IndexedVolume::zeros(extents, transform, StorageKind::Int16).unwrap();
        volume.set_value(1, 2, 3, 0, 0, 42.).unwrap();
        assert_eq!(42., volume.sample_at_point([0., 2., 4.], 0, 0, Interpolation::NearestNeighbor));
        assert_eq!(42., volume.sample_at_point([0., 2., 4.], 7, 0, Interpolation::Trilinear));
        assert_eq!(21., volume.sample_at_point([1., 2., 4.], 0, 0, Interpolation::Trilinear));
        assert_eq!([2., 2., 2.], volume.voxel_size());
    }

    #[test]
    fn unsigned_storage_reports_unsigned_values() {
        let volume = IndexedVolume::new(Extents::new(2, 1, 1, 1, 1), AffineTransform::identity(), VoxelBuffer::UInt8(vec![0xff, 3])).unwrap();
        assert_eq!(255, volume.value_i64(0, 0, 0, 0, 0).unwrap());
        assert_eq!(StorageKind::Int16, volume.natural_type());
        assert_eq!(StorageKind::UInt8, volume.storage_type());
        assert_eq!((3., 255.), volume.image_range());
    }

    #[test]
    fn regions_are_transferred_x_fastest() {
        let mut volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        let region = Region::new([1, 2, 0, 0, 0], [2, 2, 2, 1, 1]);
        assert_eq!(vec![21., 22., 31., 32., 121., 122., 131., 132.], volume.read_region(&region).unwrap());

        volume.write_region(&region, &[-1., -2., -3., -4., -5., -6., -7., -8.]).unwrap();
        assert_eq!(-7., volume.value(1, 3, 1, 0, 0).unwrap());
        assert_eq!(vec![-1, -2, -3, -4, -5, -6, -7, -8], volume.read_region_i64(&region).unwrap());

        let too_big = Region::new([3, 0, 0, 0, 0], [2, 1, 1, 1, 1]);
        assert!(matches!(volume.read_region(&too_big), Err(NeurovolError::RegionOutOfRange)));
        assert!(matches!(volume.write_region(&region, &[0.; 3]), Err(NeurovolError::DataLengthMismatch(8, 3))));
    }

    #[test]
    fn lines_are_sampled_from_the_start_point() {
        let volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        let line = volume.line([0., 1., 1.], [4., 1., 1.], 0, 0, 4, Interpolation::Trilinear);
        assert_eq!(vec![110., 111., 112., 113.], line);
        assert_eq!(LineDirection::XPlus, volume.line_direction([0., 1., 1.], [4., 1., 1.]));
        assert_eq!(LineDirection::ZMinus, volume.line_direction([0., 1., 3.], [0., 1., 1.]));
        assert_eq!(LineDirection::None, volume.line_direction([0., 0., 0.], [1., 1., 0.]));
    }

    #[test]
    fn raster_samples_an_oblique_plane() {
        let volume = ramp_volume(Extents::new(4, 4, 4, 1, 1));
        let raster = volume.raster([0., 0., 2.], [1., 0., 0.], [0., 1., 0.], 3, 2, 0, 0, Interpolation::NearestNeighbor);
        assert_eq!((2, 3), raster.dim());
        assert_eq!(212., raster[[1, 2]]);
    }

    #[test]
    fn ndarray_is_indexed_by_voxel_coordinates() {
        let volume = ramp_volume(Extents::new(4, 3, 2, 1, 1));
        let arr = volume.to_ndarray().unwrap();
        assert_eq!(&[4, 3, 2, 1, 1], arr.shape());
        assert_eq!(123., arr[[3, 2, 1, 0, 0]]);
    }

    #[test]
    fn mirrored_volume_reflects_rows_and_writes_through() {
        let backing = IndexedVolume::new(Extents::new(3, 2, 1, 1, 1), AffineTransform::identity(), VoxelBuffer::Int32(vec![1, 2, 3, 4, 5, 6])).unwrap();
        let backing = Rc::new(RefCell::new(backing));
        let mut mirror = MirroredVolume::new(Rc::clone(&backing)).unwrap();
        assert_eq!(Extents::new(6, 2, 1, 1, 1), mirror.extents());
        assert_eq!(vec![1., 2., 3., 3., 2., 1., 4., 5., 6., 6., 5., 4.], mirror.to_vec_f64());
        assert_eq!((1., 6.), mirror.image_range());

        mirror.set_value(4, 1, 0, 0, 0, 50.).unwrap();
        assert_eq!(50., backing.borrow().value(1, 1, 0, 0, 0).unwrap());
        backing.borrow_mut().refresh_image_range();
        assert_eq!((1., 50.), mirror.image_range());
    }

    #[test]
    fn mapped_rgb_volume_keeps_its_types() {
        let data = VoxelBuffer::Rgb24(vec![Rgb24::new(0, 0, 0), Rgb24::new(200, 100, 50)]);
        let volume = IndexedVolume::new(Extents::new(2, 1, 1, 1, 1), AffineTransform::identity(), data).unwrap();
        let mapped = volume.map_with(|v| v);
        assert_eq!(StorageKind::Rgb24, mapped.storage_type());
        assert_eq!(StorageKind::Rgb24, mapped.natural_type());
        let mid = Rgb24(mapped.interpolate_trilinear(0.5, 0., 0., 0, 0) as u32);
        assert_eq!((100, 50, 25), (mid.r(), mid.g(), mid.b()));
    }

    #[test]
    fn range_skips_nan() {
        let data = VoxelBuffer::Float32(vec![3., f32::NAN, -2., 7.]);
        let volume = IndexedVolume::new(Extents::new(4, 1, 1, 1, 1), AffineTransform::identity(), data).unwrap();
        assert_eq!((-2., 7.), volume.image_range());
    }

    #[test]
    fn unaddressable_extents_are_rejected() {
        let big = 32767;
        let extents = Extents::new(big, big, big, big, big);
        assert_eq!(None, extents.checked_num_voxels());
        assert_eq!(Some(24), Extents::new(2, 3, 4, 1, 1).checked_num_voxels());
        assert!(matches!(VolumeGeometry::new(extents, AffineTransform::identity()), Err(NeurovolError::TooManyVoxels)));
        assert!(matches!(IndexedVolume::zeros(extents, AffineTransform::identity(), StorageKind::UInt8), Err(NeurovolError::TooManyVoxels)));
    }

    #[test]
    fn regions_reaching_past_usize_are_out_of_range() {
        let volume = ramp_volume(Extents::new(2, 2, 1, 1, 1));
        let region = Region::new([1, 0, 0, 0, 0], [usize::MAX, 1, 1, 1, 1]);
        assert!(matches!(volume.read_region(&region), Err(NeurovolError::RegionOutOfRange)));
    }

    #[test]
    fn mapped_volume_is_read_only() {
        let volume = ramp_volume(Extents::new(2, 2, 1, 1, 1));
        let mut mapped = volume.map_with(|v| v * 2. + 0.4);
        assert_abs_diff_eq!(20.4, mapped.value(0, 1, 0, 0, 0).unwrap(), epsilon = 1e-12);
        assert_eq!(20, mapped.value_i64(0, 1, 0, 0, 0).unwrap());
        let (min, max) = mapped.image_range();
        assert_abs_diff_eq!(0.4, min, epsilon = 1e-12);
        assert_abs_diff_eq!(22.4, max, epsilon = 1e-12);
        assert!(matches!(mapped.set_value(0, 0, 0, 0, 0, 1.), Err(NeurovolError::ReadOnlyVolume)));
    }
}
