use crate::engines::{Interpolation, ResampleEngine};
use crate::error::{ProcessError, Result};
use crate::io::volume::Volume;
use nalgebra::{Matrix4, Vector4};
use ndarray::{s, Array2, Array3};
use rayon::prelude::*;

/// Pulls a moving volume onto a target grid by mapping every target voxel
/// through the affine chain into moving voxel space and sampling there.
pub struct GridResampler;

impl ResampleEngine for GridResampler {
    fn resample_to_grid(
        &self,
        moving: &Volume,
        shape: [usize; 3],
        affine: &Matrix4<f64>,
        interp: Interpolation,
    ) -> Result<Volume> {
        let inverse = moving
            .affine
            .try_inverse()
            .ok_or_else(|| ProcessError::Resample("moving affine is not invertible".into()))?;
        // Target voxel index to moving voxel index in one matrix.
        let map = inverse * affine;

        let planes: Vec<Array2<f32>> = (0..shape[2])
            .into_par_iter()
            .map(|k| {
                let mut plane = Array2::<f32>::zeros((shape[0], shape[1]));
                for i in 0..shape[0] {
                    for j in 0..shape[1] {
                        let p = map * Vector4::new(i as f64, j as f64, k as f64, 1.0);
                        plane[[i, j]] = match interp {
                            Interpolation::Nearest => sample_nearest(&moving.data, p.x, p.y, p.z),
                            Interpolation::Cubic => sample_cubic(&moving.data, p.x, p.y, p.z),
                        };
                    }
                }
                plane
            })
            .collect();

        let mut data = Array3::<f32>::zeros((shape[0], shape[1], shape[2]));
        for (k, plane) in planes.into_iter().enumerate() {
            data.slice_mut(s![.., .., k]).assign(&plane);
        }
        Ok(Volume::new(data, *affine))
    }

    fn resample_to_voxel_size(
        &self,
        moving: &Volume,
        voxel_mm: [f64; 3],
        interp: Interpolation,
    ) -> Result<Volume> {
        let current = moving.voxel_size();
        let shape = moving.shape();
        let mut new_shape = [0usize; 3];
        let mut target = moving.affine;
        for axis in 0..3 {
            if voxel_mm[axis] <= 0.0 {
                return Err(ProcessError::Resample(format!(
                    "target voxel size {} mm on axis {axis} is not positive",
                    voxel_mm[axis]
                )));
            }
            if current[axis] <= 0.0 {
                return Err(ProcessError::Resample(format!(
                    "source volume has a degenerate voxel size on axis {axis}"
                )));
            }
            let scale = voxel_mm[axis] / current[axis];
            let extent = shape[axis] as f64 * current[axis];
            new_shape[axis] = (extent / voxel_mm[axis]).round().max(1.0) as usize;
            for r in 0..3 {
                target[(r, axis)] *= scale;
            }
        }
        self.resample_to_grid(moving, new_shape, &target, interp)
    }
}

fn sample_nearest(data: &Array3<f32>, x: f64, y: f64, z: f64) -> f32 {
    let dims = data.dim();
    let (i, j, k) = (x.round(), y.round(), z.round());
    if i < 0.0 || j < 0.0 || k < 0.0 {
        return 0.0;
    }
    let (i, j, k) = (i as usize, j as usize, k as usize);
    if i >= dims.0 || j >= dims.1 || k >= dims.2 {
        return 0.0;
    }
    data[[i, j, k]]
}

/// Separable cubic convolution (Catmull-Rom). Points outside the volume
/// come out as zero; border taps clamp to the edge voxel.
fn sample_cubic(data: &Array3<f32>, x: f64, y: f64, z: f64) -> f32 {
    let dims = data.dim();
    let limit = (dims.0 as f64 - 1.0, dims.1 as f64 - 1.0, dims.2 as f64 - 1.0);
    if x < 0.0 || y < 0.0 || z < 0.0 || x > limit.0 || y > limit.1 || z > limit.2 {
        return 0.0;
    }

    let (ix, fx) = (x.floor() as isize, x - x.floor());
    let (iy, fy) = (y.floor() as isize, y - y.floor());
    let (iz, fz) = (z.floor() as isize, z - z.floor());
    let wx = cubic_weights(fx);
    let wy = cubic_weights(fy);
    let wz = cubic_weights(fz);

    let mut acc = 0.0_f64;
    for (dk, wk) in wz.iter().enumerate() {
        let k = clamp_index(iz + dk as isize - 1, dims.2);
        let mut plane = 0.0_f64;
        for (dj, wj) in wy.iter().enumerate() {
            let j = clamp_index(iy + dj as isize - 1, dims.1);
            let mut line = 0.0_f64;
            for (di, wi) in wx.iter().enumerate() {
                let i = clamp_index(ix + di as isize - 1, dims.0);
                line += wi * f64::from(data[[i, j, k]]);
            }
            plane += wj * line;
        }
        acc += wk * plane;
    }
    acc as f32
}

/// Weights for the four taps at offsets -1..=2 around the sample point,
/// with the Catmull-Rom sharpness a = -0.5. They sum to one.
fn cubic_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

fn clamp_index(idx: isize, n: usize) -> usize {
    idx.clamp(0, n as isize - 1) as usize
}
