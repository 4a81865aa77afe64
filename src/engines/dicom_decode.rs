use crate::engines::{DecoderEngine, RawSeries};
use crate::error::{ProcessError, Result};
use crate::io::discover::is_slice;
use dicom::object::{open_file, DefaultDicomObject};
use dicom::pixeldata::PixelDecoder;
use dicom_dictionary_std::tags;
use nalgebra::{Matrix4, Vector3};
use ndarray::{s, Array2, Array4, Axis};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Vendors whose slice geometry and rescale handling this decoder has been
/// checked against. Everything else is rejected up front.
const SUPPORTED_VENDORS: &[&str] = &["siemens", "philips"];

/// Reads a series directory slice by slice and assembles a volume with a
/// RAS affine built from the patient-space tags.
pub struct VendorDecoder;

#[derive(Debug)]
struct DecodedSlice {
    position: [f64; 3],
    orientation: [f64; 6],
    spacing: [f64; 2],
    thickness: f64,
    instance: i32,
    image: Array2<f32>,
}

impl DecoderEngine for VendorDecoder {
    fn decode(&self, series_dir: &Path, manufacturer: &str) -> Result<RawSeries> {
        let series = series_label(series_dir);
        let vendor = manufacturer.to_lowercase();
        if !SUPPORTED_VENDORS.iter().any(|v| vendor.contains(v)) {
            return Err(ProcessError::UnsupportedVendor(manufacturer.to_string()));
        }

        let paths = slice_paths(series_dir)?;
        if paths.is_empty() {
            return Err(ProcessError::decode(&series, "no slice files found"));
        }

        let mut slices = paths
            .par_iter()
            .map(|path| read_slice(path, &series))
            .collect::<Result<Vec<_>>>()?;

        let groups = group_by_position(&mut slices, &series)?;
        assemble(groups, &series)
    }
}

fn series_label(series_dir: &Path) -> String {
    series_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| series_dir.display().to_string())
}

fn slice_paths(series_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(series_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_slice(path))
        .collect();
    paths.sort();
    Ok(paths)
}

fn read_slice(path: &Path, series: &str) -> Result<DecodedSlice> {
    let obj = open_file(path)?;

    let position = multi_f64(&obj, tags::IMAGE_POSITION_PATIENT, 3, series, "ImagePositionPatient")?;
    let orientation = multi_f64(
        &obj,
        tags::IMAGE_ORIENTATION_PATIENT,
        6,
        series,
        "ImageOrientationPatient",
    )?;
    let spacing = multi_f64(&obj, tags::PIXEL_SPACING, 2, series, "PixelSpacing")?;

    let thickness = obj
        .element(tags::SLICE_THICKNESS)
        .ok()
        .and_then(|e| e.to_float32().ok())
        .map(f64::from)
        .unwrap_or(1.0);

    let instance = obj
        .element(tags::INSTANCE_NUMBER)
        .ok()
        .and_then(|e| e.to_int::<i32>().ok())
        .unwrap_or(0);

    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| ProcessError::decode(series, format!("pixel data: {e}")))?;
    let frames = decoded
        .to_ndarray::<f32>()
        .map_err(|e| ProcessError::decode(series, format!("pixel conversion: {e}")))?;
    if frames.shape()[0] != 1 {
        return Err(ProcessError::geometry(series, "multi-frame slices are not supported"));
    }
    let image = frames.slice_move(s![0, .., .., 0]);

    Ok(DecodedSlice {
        position: [position[0], position[1], position[2]],
        orientation: [
            orientation[0],
            orientation[1],
            orientation[2],
            orientation[3],
            orientation[4],
            orientation[5],
        ],
        spacing: [spacing[0], spacing[1]],
        thickness,
        instance,
        image,
    })
}

fn multi_f64(
    obj: &DefaultDicomObject,
    tag: dicom::core::Tag,
    n: usize,
    series: &str,
    name: &str,
) -> Result<Vec<f64>> {
    let values = obj
        .element(tag)
        .ok()
        .and_then(|e| e.to_multi_float32().ok())
        .ok_or_else(|| ProcessError::decode(series, format!("missing {name}")))?;
    if values.len() < n {
        return Err(ProcessError::decode(
            series,
            format!("{name} has {} values, expected {n}", values.len()),
        ));
    }
    Ok(values.iter().map(|v| f64::from(*v)).collect())
}

/// Sorts slices along the stack normal and splits them into per-position
/// groups. A position occurring m times means the series holds m volumes;
/// within a position, instance number orders the volumes.
fn group_by_position(
    slices: &mut Vec<DecodedSlice>,
    series: &str,
) -> Result<Vec<Vec<DecodedSlice>>> {
    let normal = stack_normal(&slices[0]);
    let projection =
        |s: &DecodedSlice| normal.dot(&Vector3::new(s.position[0], s.position[1], s.position[2]));

    slices.sort_by(|a, b| {
        projection(a)
            .partial_cmp(&projection(b))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.instance.cmp(&b.instance))
    });

    // 1e-3 mm granularity soaks up decimal-string formatting differences.
    let mut groups: Vec<Vec<DecodedSlice>> = Vec::new();
    let mut last_key = i64::MIN;
    for slice in slices.drain(..) {
        let key = (projection(&slice) * 1000.0).round() as i64;
        if groups.is_empty() || key != last_key {
            groups.push(Vec::new());
            last_key = key;
        }
        groups
            .last_mut()
            .ok_or_else(|| ProcessError::geometry(series, "empty slice grouping"))?
            .push(slice);
    }

    let per_position = groups[0].len();
    if groups.iter().any(|g| g.len() != per_position) {
        return Err(ProcessError::geometry(
            series,
            "slice count differs between stack positions",
        ));
    }
    Ok(groups)
}

fn stack_normal(slice: &DecodedSlice) -> Vector3<f64> {
    let row = Vector3::new(slice.orientation[0], slice.orientation[1], slice.orientation[2]);
    let col = Vector3::new(slice.orientation[3], slice.orientation[4], slice.orientation[5]);
    row.cross(&col)
}

fn assemble(groups: Vec<Vec<DecodedSlice>>, series: &str) -> Result<RawSeries> {
    let n_pos = groups.len();
    let n_vol = groups[0].len();
    let (rows, cols) = groups[0][0].image.dim();
    if groups
        .iter()
        .flatten()
        .any(|slice| slice.image.dim() != (rows, cols))
    {
        return Err(ProcessError::geometry(
            series,
            "slice dimensions differ within the series",
        ));
    }

    let first = &groups[0][0];
    let step = if n_pos > 1 {
        let a = Vector3::from(groups[0][0].position);
        let b = Vector3::from(groups[1][0].position);
        b - a
    } else {
        stack_normal(first) * first.thickness
    };
    let affine = build_affine(&first.orientation, &first.spacing, &first.position, &step);

    let mut data = Array4::<f32>::zeros((rows, cols, n_pos, n_vol));
    for (k, group) in groups.iter().enumerate() {
        for (v, slice) in group.iter().enumerate() {
            data.slice_mut(s![.., .., k, v]).assign(&slice.image);
        }
    }

    let data = if n_vol == 1 {
        data.index_axis_move(Axis(3), 0).into_dyn()
    } else {
        data.into_dyn()
    };
    Ok(RawSeries { data, affine })
}

/// Maps voxel index (row, column, slice) to RAS millimetres. The patient
/// tags are LPS, so the first two rows flip sign.
pub(crate) fn build_affine(
    orientation: &[f64; 6],
    spacing: &[f64; 2],
    first_position: &[f64; 3],
    slice_step: &Vector3<f64>,
) -> Matrix4<f64> {
    let row_dir = Vector3::new(orientation[0], orientation[1], orientation[2]);
    let col_dir = Vector3::new(orientation[3], orientation[4], orientation[5]);

    // Row index advances along the column direction and vice versa.
    let axis0 = col_dir * spacing[0];
    let axis1 = row_dir * spacing[1];

    let mut affine = Matrix4::identity();
    for r in 0..3 {
        affine[(r, 0)] = axis0[r];
        affine[(r, 1)] = axis1[r];
        affine[(r, 2)] = slice_step[r];
        affine[(r, 3)] = first_position[r];
    }
    for c in 0..4 {
        affine[(0, c)] = -affine[(0, c)];
        affine[(1, c)] = -affine[(1, c)];
    }
    affine
}

#[cfg(test)]
mod dicom_decode_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axial_slice(z: f64, instance: i32, fill: f32) -> DecodedSlice {
        DecodedSlice {
            position: [10.0, 20.0, z],
            orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            spacing: [2.0, 3.0],
            thickness: 1.5,
            instance,
            image: Array2::from_elem((4, 5), fill),
        }
    }

    #[test]
    fn test_axial_affine_flips_lps_to_ras() {
        let step = Vector3::new(0.0, 0.0, 1.5);
        let affine = build_affine(
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            &[2.0, 3.0],
            &[10.0, 20.0, 30.0],
            &step,
        );
        // Row step moves along -y, column step along -x in RAS.
        assert_relative_eq!(affine[(1, 0)], -2.0);
        assert_relative_eq!(affine[(0, 1)], -3.0);
        assert_relative_eq!(affine[(2, 2)], 1.5);
        assert_relative_eq!(affine[(0, 3)], -10.0);
        assert_relative_eq!(affine[(1, 3)], -20.0);
        assert_relative_eq!(affine[(2, 3)], 30.0);
    }

    #[test]
    fn test_single_volume_assembles_to_three_dims() {
        let groups = vec![
            vec![axial_slice(0.0, 1, 1.0)],
            vec![axial_slice(1.5, 2, 2.0)],
            vec![axial_slice(3.0, 3, 3.0)],
        ];
        let series = assemble(groups, "t1").unwrap();
        assert_eq!(series.data.shape(), &[4, 5, 3]);
        assert_relative_eq!(series.data[[0, 0, 1]], 2.0);
    }

    #[test]
    fn test_repeated_positions_become_fourth_axis() {
        let mut slices = vec![
            axial_slice(0.0, 3, 10.0),
            axial_slice(0.0, 1, 1.0),
            axial_slice(1.5, 4, 20.0),
            axial_slice(1.5, 2, 2.0),
        ];
        let groups = group_by_position(&mut slices, "dwi").unwrap();
        let series = assemble(groups, "dwi").unwrap();
        assert_eq!(series.data.shape(), &[4, 5, 2, 2]);
        // Lower instance number lands in the first stacked volume.
        assert_relative_eq!(series.data[[0, 0, 0, 0]], 1.0);
        assert_relative_eq!(series.data[[0, 0, 0, 1]], 10.0);
        assert_relative_eq!(series.data[[0, 0, 1, 1]], 20.0);
    }

    #[test]
    fn test_uneven_position_counts_rejected() {
        let mut slices = vec![
            axial_slice(0.0, 1, 1.0),
            axial_slice(0.0, 2, 2.0),
            axial_slice(1.5, 3, 3.0),
        ];
        let err = group_by_position(&mut slices, "dwi").unwrap_err();
        assert!(
            err.to_string().contains("slice count differs"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_mismatched_slice_shapes_rejected() {
        let mut odd = axial_slice(1.5, 2, 2.0);
        odd.image = Array2::zeros((6, 5));
        let groups = vec![vec![axial_slice(0.0, 1, 1.0)], vec![odd]];
        let err = assemble(groups, "t2").unwrap_err();
        assert!(
            err.to_string().contains("dimensions differ"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_single_slice_uses_thickness_for_step() {
        let groups = vec![vec![axial_slice(5.0, 1, 1.0)]];
        let series = assemble(groups, "loc").unwrap();
        assert_relative_eq!(series.affine[(2, 2)], 1.5);
    }
}
