pub mod dicom_decode;
pub mod resample;
pub mod tools;

use crate::config::CaseConfig;
use crate::error::Result;
use crate::io::volume::Volume;
use nalgebra::Matrix4;
use ndarray::{Array3, ArrayD};
use std::any::Any;
use std::path::Path;

/// A decoded series before channel reduction: 3-D for a plain acquisition,
/// 4-D with volumes stacked on the last axis for multi-volume series.
#[derive(Debug, Clone)]
pub struct RawSeries {
    pub data: ArrayD<f32>,
    pub affine: Matrix4<f64>,
}

/// Opaque token for a computed transform. Only the engine that produced it
/// can look inside; the pipeline just carries it between register and apply.
pub struct TransformHandle(Box<dyn Any + Send>);

impl std::fmt::Debug for TransformHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransformHandle")
    }
}

impl TransformHandle {
    pub fn new<T: Any + Send>(inner: T) -> Self {
        TransformHandle(Box::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// Interpolation used when pulling a volume onto a new grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Cubic,
}

/// Transform family a registration run solves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformFamily {
    Rigid,
    Affine,
}

/// Turns a series directory of slices into a volume in scanner space.
pub trait DecoderEngine {
    fn decode(&self, series_dir: &Path, manufacturer: &str) -> Result<RawSeries>;
}

/// Pulls volumes onto new voxel grids.
pub trait ResampleEngine {
    /// Resamples `moving` onto the grid described by `shape` and `affine`.
    /// Voxels outside the moving volume come out as zero.
    fn resample_to_grid(
        &self,
        moving: &Volume,
        shape: [usize; 3],
        affine: &Matrix4<f64>,
        interp: Interpolation,
    ) -> Result<Volume>;

    /// Resamples `moving` to the given voxel size, keeping orientation and
    /// field of view.
    fn resample_to_voxel_size(
        &self,
        moving: &Volume,
        voxel_mm: [f64; 3],
        interp: Interpolation,
    ) -> Result<Volume>;
}

/// Intensity-based registration.
///
/// `register` solves a transform of the requested family and returns the
/// moving volume warped onto the fixed grid (carrying the fixed affine)
/// together with a handle; `apply_transform` re-applies that handle to
/// another volume sharing the moving volume's space.
pub trait RegistrationEngine {
    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        family: TransformFamily,
    ) -> Result<(Volume, TransformHandle)>;

    fn apply_transform(
        &self,
        handle: &TransformHandle,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<Volume>;
}

/// Brain extraction: returns the skull-stripped volume and its binary mask.
pub trait ExtractionEngine {
    fn extract(&self, volume: &Volume) -> Result<(Volume, Array3<u8>)>;
}

/// Every external capability one case run needs, bundled so the pipeline
/// stages stay oblivious to which implementation is behind each seam.
pub struct EngineSet {
    pub decoder: Box<dyn DecoderEngine>,
    pub resampler: Box<dyn ResampleEngine>,
    pub registration: Box<dyn RegistrationEngine>,
    pub extraction: Box<dyn ExtractionEngine>,
}

impl EngineSet {
    pub fn production(config: &CaseConfig) -> Self {
        EngineSet {
            decoder: Box::new(dicom_decode::VendorDecoder),
            resampler: Box::new(resample::GridResampler),
            registration: Box::new(tools::CommandRegistration::new(
                &config.registration_cmd,
                &config.apply_cmd,
            )),
            extraction: Box::new(tools::CommandExtraction::new(&config.extraction_cmd)),
        }
    }
}
