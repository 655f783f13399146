//! Resolution of the 4x4 index-to-space transform of a volume from its header.
//!
//! The methods are tried in order and the first applicable one wins:
//! the NIFTI quaternion (qform) and affine rows (sform), then for SPM volumes the
//! external `M` matrix and the origin based default, and finally the plain
//! pixel spacing diagonal used for vanilla Analyze files.

use log::{debug, warn};
use ndarray::{arr2, Array2};

use std::collections::HashMap;

use crate::error::{NeurovolError, Result};
use crate::matfile::MatFile;
use crate::nifti_header::VolumeHeader;

/// Name of the variable holding the SPM voxel-to-world matrix.
pub const SPM_MATRIX_NAME: &str = "M";

/// A homogeneous 4x4 matrix mapping 0-indexed voxel coordinates to millimeters.
/// The bottom row is always `[0, 0, 0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    m: [[f64; 4]; 4],
}

impl Default for AffineTransform {
    fn default() -> AffineTransform {
        AffineTransform::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> AffineTransform {
        AffineTransform::from_rows([[1., 0., 0., 0.], [0., 1., 0., 0.], [0., 0., 1., 0.]])
    }

    /// Build a transform from its first three rows.
    pub fn from_rows(rows: [[f64; 4]; 3]) -> AffineTransform {
        AffineTransform { m: [rows[0], rows[1], rows[2], [0., 0., 0., 1.]] }
    }

    /// A diagonal scaling with the given translation.
    pub fn from_scale_translation(scale: [f64; 3], translation: [f64; 3]) -> AffineTransform {
        AffineTransform::from_rows([
            [scale[0], 0., 0., translation[0]],
            [0., scale[1], 0., translation[1]],
            [0., 0., scale[2], translation[2]],
        ])
    }

    /// Build a transform from a 4x4 array. The bottom row of the input is ignored.
    pub fn from_array2(matrix: &Array2<f64>) -> Result<AffineTransform> {
        if matrix.dim() != (4, 4) {
            return Err(NeurovolError::UnsupportedMatrix(format!("expected a 4x4 matrix, found {:?}", matrix.dim())));
        }
        let mut rows = [[0.; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = matrix[[r, c]];
            }
        }
        Ok(AffineTransform::from_rows(rows))
    }

    pub fn matrix(&self) -> &[[f64; 4]; 4] {
        &self.m
    }

    pub fn to_array2(&self) -> Array2<f64> {
        arr2(&self.m)
    }

    pub fn translation(&self) -> [f64; 3] {
        [self.m[0][3], self.m[1][3], self.m[2][3]]
    }

    pub fn set_translation(&mut self, translation: [f64; 3]) {
        for (row, t) in translation.iter().enumerate() {
            self.m[row][3] = *t;
        }
    }

    /// Map a point, translation included.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = self.apply_vector(p);
        for (row, v) in out.iter_mut().enumerate() {
            *v += self.m[row][3];
        }
        out
    }

    /// Map a direction, ignoring the translation.
    pub fn apply_vector(&self, v: [f64; 3]) -> [f64; 3] {
        let mut out = [0.; 3];
        for (row, o) in out.iter_mut().enumerate() {
            *o = self.m[row][0] * v[0] + self.m[row][1] * v[1] + self.m[row][2] * v[2];
        }
        out
    }

    /// Length of each voxel axis in space, i.e. the norms of the first three columns.
    pub fn voxel_size(&self) -> [f64; 3] {
        let mut size = [0.; 3];
        for (col, s) in size.iter_mut().enumerate() {
            *s = (0..3).map(|row| self.m[row][col] * self.m[row][col]).sum::<f64>().sqrt();
        }
        size
    }

    /// The absolute column sums of the linear part.
    pub fn column_abs_sums(&self) -> [f64; 3] {
        let mut sums = [0.; 3];
        for (col, s) in sums.iter_mut().enumerate() {
            *s = (0..3).map(|row| self.m[row][col].abs()).sum();
        }
        sums
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// The inverse transform, `None` if the linear part is singular.
    pub fn inverse(&self) -> Option<AffineTransform> {
        let det = self.determinant();
        if det == 0. || !det.is_finite() {
            return None;
        }
        let m = &self.m;
        let mut inv = [[0.; 4]; 3];
        inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det;
        inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det;
        inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det;
        inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det;
        inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det;
        inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det;
        inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det;
        inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det;
        inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det;
        for row in 0..3 {
            inv[row][3] = -(0..3).map(|col| inv[row][col] * m[col][3]).sum::<f64>();
        }
        Some(AffineTransform::from_rows(inv))
    }
}


/// The policy that produced a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMethod {
    /// NIFTI qform: quaternion, pixel spacing and offset.
    Quaternion,
    /// NIFTI sform: the three stored affine rows.
    Affine,
    /// SPM: the `M` matrix of the companion `.mat` file.
    SpmExternal,
    /// SPM: pixel spacing around the stored origin or the volume center.
    SpmDefault,
    /// Analyze: pixel spacing only.
    PixelSpacing,
}

/// A transform together with the policy it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTransform {
    pub matrix: AffineTransform,
    pub method: TransformMethod,
}


/// Anything that can hand out a named matrix, e.g. a decoded MAT file.
pub trait MatrixSource {
    fn named_matrix(&self, name: &str) -> Option<Array2<f64>>;
}

impl MatrixSource for MatFile {
    fn named_matrix(&self, name: &str) -> Option<Array2<f64>> {
        self.matrix(name).cloned()
    }
}

impl MatrixSource for HashMap<String, Array2<f64>> {
    fn named_matrix(&self, name: &str) -> Option<Array2<f64>> {
        self.get(name).cloned()
    }
}


/// Compute the index-to-space transform of a volume.
///
/// For NIFTI headers the qform is tried before the sform when `prefer_standard_space`
/// is set, and after it otherwise. Headers that are not NIFTI, or NIFTI headers with
/// neither form set, go through the SPM chain when flagged as SPM and fall back to the
/// pixel spacing diagonal otherwise. An `external` matrix that lacks a usable `M`
/// is logged and skipped.
pub fn resolve_transform(header: &VolumeHeader, prefer_standard_space: bool, external: Option<&dyn MatrixSource>) -> ResolvedTransform {
    let resolved = resolve(header, prefer_standard_space, external);
    debug!("Resolved index-to-space transform using the {:?} method.", resolved.method);
    resolved
}


fn resolve(header: &VolumeHeader, prefer_standard_space: bool, external: Option<&dyn MatrixSource>) -> ResolvedTransform {
    if header.format().is_nifti() {
        let qform = header.qform_code > 0;
        let sform = header.sform_code > 0;
        if qform && (prefer_standard_space || !sform) {
            return ResolvedTransform { matrix: quaternion_transform(header), method: TransformMethod::Quaternion };
        }
        if sform {
            return ResolvedTransform { matrix: sform_transform(header), method: TransformMethod::Affine };
        }
    }

    if header.spm {
        if let Some(source) = external {
            match spm_external_transform(source) {
                Ok(matrix) => return ResolvedTransform { matrix, method: TransformMethod::SpmExternal },
                Err(e) => warn!("Ignoring SPM matrix: {}. Falling back to the origin based transform.", e),
            }
        }
        return ResolvedTransform { matrix: spm_default_transform(header), method: TransformMethod::SpmDefault };
    }

    ResolvedTransform { matrix: pixel_spacing_transform(header), method: TransformMethod::PixelSpacing }
}


/// The NIFTI qform method. The scalar quaternion part `a` is derived from `b`, `c` and `d`,
/// with a negative discriminant clamped to zero.
pub fn quaternion_transform(header: &VolumeHeader) -> AffineTransform {
    let b = header.quatern_b as f64;
    let c = header.quatern_c as f64;
    let d = header.quatern_d as f64;
    let a = (1. - b * b - c * c - d * d).max(0.).sqrt();

    let rotation = [
        [a * a + b * b - c * c - d * d, 2. * b * c - 2. * a * d, 2. * b * d + 2. * a * c],
        [2. * b * c + 2. * a * d, a * a + c * c - b * b - d * d, 2. * c * d - 2. * a * b],
        [2. * b * d - 2. * a * c, 2. * c * d + 2. * a * b, a * a + d * d - c * c - b * b],
    ];
    let mut spacing = [0.; 3];
    for (idx, s) in spacing.iter_mut().enumerate() {
        let v = header.pixdim[idx + 1] as f64;
        *s = if v == 0. { 1. } else { v };
    }
    spacing[2] *= header.qfac();

    let offset = [header.qoffset_x as f64, header.qoffset_y as f64, header.qoffset_z as f64];
    let mut rows = [[0.; 4]; 3];
    for row in 0..3 {
        for col in 0..3 {
            rows[row][col] = rotation[row][col] * spacing[col];
        }
        rows[row][3] = offset[row];
    }
    AffineTransform::from_rows(rows)
}


/// The NIFTI sform method: the stored rows, as is.
pub fn sform_transform(header: &VolumeHeader) -> AffineTransform {
    let mut rows = [[0.; 4]; 3];
    for (dst, src) in rows.iter_mut().zip(&[header.srow_x, header.srow_y, header.srow_z]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s as f64;
        }
    }
    AffineTransform::from_rows(rows)
}


/// The SPM `M` matrix maps 1-indexed voxels. Shift its translation by the image of
/// one voxel step along every axis so it maps 0-indexed voxels.
pub fn spm_external_transform(source: &dyn MatrixSource) -> Result<AffineTransform> {
    let m = source.named_matrix(SPM_MATRIX_NAME)
        .ok_or_else(|| NeurovolError::UnsupportedMatrix(format!("no variable '{}'", SPM_MATRIX_NAME)))?;
    let mut transform = AffineTransform::from_array2(&m)?;
    let p0 = transform.apply([0., 0., 0.]);
    let p1 = transform.apply([1., 1., 1.]);
    let mut translation = transform.translation();
    for axis in 0..3 {
        translation[axis] += p1[axis] - p0[axis];
    }
    transform.set_translation(translation);
    Ok(transform)
}


/// The SPM default: spacing on the diagonal, centered on the stored origin. An all zero
/// origin is replaced by the center voxel `(dim - 1) / 2`, rounded down, and all zero
/// spacing by unit spacing.
pub fn spm_default_transform(header: &VolumeHeader) -> AffineTransform {
    let origin = header.origin().unwrap_or([0; 3]);
    let mut center = [0.; 3];
    for axis in 0..3 {
        center[axis] = if origin == [0; 3] {
            ((header.dim[axis + 1] as i32 - 1) / 2) as f64
        } else {
            origin[axis] as f64
        };
    }

    let mut spacing = [header.pixdim[1] as f64, header.pixdim[2] as f64, header.pixdim[3] as f64];
    if spacing == [0.; 3] {
        spacing = [1.; 3];
    }
    let translation = [-spacing[0] * center[0], -spacing[1] * center[1], -spacing[2] * center[2]];
    AffineTransform::from_scale_translation(spacing, translation)
}


/// The Analyze fallback: spacing on the diagonal, no translation.
pub fn pixel_spacing_transform(header: &VolumeHeader) -> AffineTransform {
    let mut spacing = [0.; 3];
    for (idx, s) in spacing.iter_mut().enumerate() {
        let v = header.pixdim[idx + 1] as f64;
        *s = if v == 0. {
            warn!("Pixel spacing along axis {} is 0, using 1.", idx);
            1.
        } else {
            v
        };
    }
    AffineTransform::from_scale_translation(spacing, [0.; 3])
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use byteordered::Endianness;

    fn analyze_header(spm: bool) -> VolumeHeader {
        let mut hdr = VolumeHeader::new(Endianness::Little, false)
            .with_dim([3, 5, 4, 3, 1, 1, 1, 1])
            .with_pixdim([0., 2., 2., 2., 0., 0., 0., 0.]);
        hdr.magic = [0; 4];
        hdr.spm = spm;
        hdr.set_origin([0, 0, 0]).unwrap();
        hdr
    }

    fn assert_transform_eq(expected: [[f64; 4]; 3], actual: &AffineTransform) {
        assert_abs_diff_eq!(AffineTransform::from_rows(expected).to_array2(), actual.to_array2(), epsilon = 1e-6);
    }

    #[test]
    fn identity_quaternion_scales_by_spacing() {
        let hdr = VolumeHeader::new(Endianness::Little, true)
            .with_pixdim([1., 2., 3., 4., 0., 0., 0., 0.])
            .with_qform(1, [0., 0., 0.], [10., 20., 30.]);
        assert_transform_eq([[2., 0., 0., 10.], [0., 3., 0., 20.], [0., 0., 4., 30.]], &quaternion_transform(&hdr));
    }

    #[test]
    fn half_turn_about_z_flips_x_and_y() {
        let hdr = VolumeHeader::new(Endianness::Little, true).with_qform(1, [0., 0., 1.], [0., 0., 0.]);
        let t = quaternion_transform(&hdr);
        assert_transform_eq([[-1., 0., 0., 0.], [0., -1., 0., 0.], [0., 0., 1., 0.]], &t);
    }

    #[test]
    fn negative_qfac_flips_the_third_column() {
        let hdr = VolumeHeader::new(Endianness::Little, true)
            .with_pixdim([-1., 1., 1., 2., 0., 0., 0., 0.])
            .with_qform(1, [0., 0., 0.], [0., 0., 0.]);
        assert_eq!(-2., quaternion_transform(&hdr).matrix()[2][2]);
    }

    #[test]
    fn overflowing_quaternion_is_clamped() {
        let hdr = VolumeHeader::new(Endianness::Little, true).with_qform(1, [0.7072, 0.7072, 0.], [0., 0., 0.]);
        let t = quaternion_transform(&hdr);
        assert!(t.matrix().iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn qform_wins_when_standard_space_is_preferred() {
        let hdr = VolumeHeader::new(Endianness::Little, true)
            .with_qform(1, [0., 0., 0.], [5., 5., 5.])
            .with_sform(2, [[3., 0., 0., 1.], [0., 3., 0., 2.], [0., 0., 3., 3.]]);

        let q = resolve_transform(&hdr, true, None);
        assert_eq!(TransformMethod::Quaternion, q.method);
        assert_eq!([5., 5., 5.], q.matrix.translation());

        let s = resolve_transform(&hdr, false, None);
        assert_eq!(TransformMethod::Affine, s.method);
        assert_eq!([1., 2., 3.], s.matrix.translation());
    }

    #[test]
    fn sform_is_used_without_qform() {
        let hdr = VolumeHeader::new(Endianness::Big, true)
            .with_sform(1, [[3., 0., 0., 1.], [0., 3., 0., 2.], [0., 0., 3., 3.]]);
        let r = resolve_transform(&hdr, true, None);
        assert_eq!(TransformMethod::Affine, r.method);
        assert_eq!(3., r.matrix.matrix()[1][1]);
    }

    #[test]
    fn nifti_without_forms_uses_pixel_spacing() {
        let mut hdr = VolumeHeader::new(Endianness::Little, true).with_pixdim([1., 2., 3., 4., 0., 0., 0., 0.]);
        hdr.sform_code = 0;
        let r = resolve_transform(&hdr, true, None);
        assert_eq!(TransformMethod::PixelSpacing, r.method);
        assert_eq!([2., 3., 4.], r.matrix.voxel_size());
    }

    #[test]
    fn spm_matrix_is_rebased_to_zero_indexed_voxels() {
        let hdr = analyze_header(true);
        let mut source: HashMap<String, Array2<f64>> = HashMap::new();
        source.insert("M".to_string(), arr2(&[
            [2., 0., 0., -10.],
            [0., 2., 0., -20.],
            [0., 0., 2., -30.],
            [0., 0., 0., 1.],
        ]));
        let r = resolve_transform(&hdr, true, Some(&source as &dyn MatrixSource));
        assert_eq!(TransformMethod::SpmExternal, r.method);
        assert_eq!([-8., -18., -28.], r.matrix.apply([0., 0., 0.]));
        assert_eq!([-6., -16., -26.], r.matrix.apply([1., 1., 1.]));
    }

    #[test]
    fn malformed_spm_matrix_falls_back_to_the_default() {
        let hdr = analyze_header(true);
        let mut source: HashMap<String, Array2<f64>> = HashMap::new();
        source.insert("M".to_string(), Array2::zeros((3, 3)));
        let r = resolve_transform(&hdr, true, Some(&source as &dyn MatrixSource));
        assert_eq!(TransformMethod::SpmDefault, r.method);
    }

    #[test]
    fn spm_default_centers_on_the_volume_rounding_down() {
        let hdr = analyze_header(true);
        let r = resolve_transform(&hdr, true, None);
        assert_eq!(TransformMethod::SpmDefault, r.method);
        assert_transform_eq([[2., 0., 0., -4.], [0., 2., 0., -2.], [0., 0., 2., -2.]], &r.matrix);
    }

    #[test]
    fn spm_default_uses_the_stored_origin() {
        let mut hdr = analyze_header(true).with_pixdim([0., 0., 0., 0., 0., 0., 0., 0.]);
        hdr.set_origin([3, 2, 1]).unwrap();
        let t = spm_default_transform(&hdr);
        assert_transform_eq([[1., 0., 0., -3.], [0., 1., 0., -2.], [0., 0., 1., -1.]], &t);
    }

    #[test]
    fn plain_analyze_has_no_translation() {
        let hdr = analyze_header(false);
        let r = resolve_transform(&hdr, true, None);
        assert_eq!(TransformMethod::PixelSpacing, r.method);
        assert_transform_eq([[2., 0., 0., 0.], [0., 2., 0., 0.], [0., 0., 2., 0.]], &r.matrix);
    }

    #[test]
    fn inverse_undoes_the_transform() {
        let t = AffineTransform::from_rows([[0., -2., 0., 5.], [3., 0., 0., -1.], [0., 0., 1.5, 7.]]);
        let inv = t.inverse().unwrap();
        let p = [1.5, -2., 3.25];
        let back = inv.apply(t.apply(p));
        for axis in 0..3 {
            assert_abs_diff_eq!(p[axis], back[axis], epsilon = 1e-12);
        }
        assert!(AffineTransform::from_scale_translation([1., 0., 1.], [0.; 3]).inverse().is_none());
    }
}
