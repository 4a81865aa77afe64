use nalgebra::Matrix4;
use ndarray::Array3;

/// A 3-D scalar volume in scanner space.
///
/// `affine` maps voxel indices (i, j, k, 1) to world millimetres, NIfTI
/// convention: the upper-left 3x3 holds direction cosines scaled by voxel
/// size, the last column the world position of voxel (0, 0, 0).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub affine: Matrix4<f64>,
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Matrix4<f64>) -> Self {
        Volume { data, affine }
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Voxel edge lengths in millimetres, as the norms of the affine columns.
    pub fn voxel_size(&self) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (axis, v) in out.iter_mut().enumerate() {
            *v = self.affine.fixed_view::<3, 1>(0, axis).norm();
        }
        out
    }

    /// Clamps every voxel below `floor` up to `floor`. Cubic resampling
    /// overshoots near sharp edges, so intensities are re-floored after it.
    pub fn clamp_min(&mut self, floor: f32) {
        self.data.mapv_inplace(|v| v.max(floor));
    }

    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}
