use crate::error::{ProcessError, Result};
use crate::io::volume::Volume;
use nalgebra::Matrix4;
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{InMemNiftiObject, IntoNdArray, NiftiHeader, NiftiObject};
use std::fs;
use std::path::Path;

/// Affine of a NIfTI header: the sform when one is declared, otherwise a
/// plain scaling matrix built from pixdim.
pub fn affine_from_header(header: &NiftiHeader) -> Matrix4<f64> {
    if header.sform_code > 0 {
        let x = &header.srow_x;
        let y = &header.srow_y;
        let z = &header.srow_z;
        Matrix4::new(
            x[0] as f64,
            x[1] as f64,
            x[2] as f64,
            x[3] as f64,
            y[0] as f64,
            y[1] as f64,
            y[2] as f64,
            y[3] as f64,
            z[0] as f64,
            z[1] as f64,
            z[2] as f64,
            z[3] as f64,
            0.0,
            0.0,
            0.0,
            1.0,
        )
    } else {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = header.pixdim[1] as f64;
        affine[(1, 1)] = header.pixdim[2] as f64;
        affine[(2, 2)] = header.pixdim[3] as f64;
        affine
    }
}

/// Header describing `volume`, with the affine written to the sform rows.
/// The writer fills in dim and datatype from the array itself.
pub fn header_for(volume: &Volume) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let a = &volume.affine;

    header.sform_code = 1;
    header.qform_code = 0;
    for col in 0..4 {
        header.srow_x[col] = a[(0, col)] as f32;
        header.srow_y[col] = a[(1, col)] as f32;
        header.srow_z[col] = a[(2, col)] as f32;
    }

    let size = volume.voxel_size();
    header.pixdim[1] = size[0] as f32;
    header.pixdim[2] = size[1] as f32;
    header.pixdim[3] = size[2] as f32;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;

    header
}

fn squeeze_to_3d(mut data: ArrayD<f32>, path: &Path) -> Result<Array3<f32>> {
    // trailing singleton axes (e.g. a 4-D file holding one frame) are dropped
    while data.ndim() > 3 {
        let last = Axis(data.ndim() - 1);
        if data.len_of(last) != 1 {
            return Err(ProcessError::geometry(
                path,
                format!("expected a 3-D volume, found shape {:?}", data.shape()),
            ));
        }
        data = data.remove_axis(last);
    }
    data.into_dimensionality::<Ix3>()
        .map_err(|e| ProcessError::geometry(path, e.to_string()))
}

/// Reads a `.nii` / `.nii.gz` file into a [`Volume`].
pub fn load_volume(path: &Path) -> Result<Volume> {
    let obj = InMemNiftiObject::from_file(path)?;
    let affine = affine_from_header(obj.header());
    let data = obj.into_volume().into_ndarray::<f32>()?;
    Ok(Volume::new(squeeze_to_3d(data, path)?, affine))
}

/// Writes `volume` as `.nii` or `.nii.gz`, compression chosen by extension.
pub fn save_volume(path: &Path, volume: &Volume) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    WriterOptions::new(path)
        .reference_header(&header_for(volume))
        .write_nifti(&volume.data)?;
    Ok(())
}

/// Loads the reference atlas and multiplies its brain mask in, so the
/// registration target carries no skull.
pub fn load_atlas(volume_path: &Path, mask_path: &Path) -> Result<Volume> {
    let mut atlas = load_volume(volume_path)?;
    let mask = load_volume(mask_path)?;

    if atlas.shape() != mask.shape() {
        return Err(ProcessError::geometry(
            mask_path,
            format!(
                "atlas mask shape {:?} does not match atlas shape {:?}",
                mask.shape(),
                atlas.shape()
            ),
        ));
    }
    atlas.data = &atlas.data * &mask.data;
    Ok(atlas)
}
