use crate::classify::rules::SeriesMeta;
use crate::engines::resample::GridResampler;
use crate::engines::{
    DecoderEngine, EngineSet, ExtractionEngine, Interpolation, RawSeries, RegistrationEngine,
    ResampleEngine, TransformFamily, TransformHandle,
};
use crate::error::{ProcessError, Result};
use crate::io::store::{Channel, SlotData, Stage, Study};
use crate::io::volume::Volume;
use nalgebra::Matrix4;
use ndarray::{s, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Creates a constant-valued volume with an identity affine.
pub fn dummy_volume(shape: [usize; 3], fill: f32) -> Volume {
    Volume::new(
        Array3::from_elem((shape[0], shape[1], shape[2]), fill),
        Matrix4::identity(),
    )
}

/// Creates a reproducible noise volume with values in 0..100.
pub fn noise_volume(shape: [usize; 3], seed: u64) -> Volume {
    let mut rng = StdRng::seed_from_u64(seed);
    let data =
        Array3::from_shape_fn((shape[0], shape[1], shape[2]), |_| rng.random_range(0.0..100.0));
    Volume::new(data, Matrix4::identity())
}

/// Creates a slot whose volume peaks at exactly `peak`.
pub fn dummy_slot(peak: f32, time: Option<f64>) -> SlotData {
    let mut data = Array3::zeros((2, 2, 2));
    data[[1, 1, 1]] = peak;
    SlotData::new(Volume::new(data, Matrix4::identity()), time)
}

pub fn dummy_meta(desc: &str) -> SeriesMeta {
    SeriesMeta {
        series_dir: PathBuf::from(format!("/tmp/series/{desc}")),
        description: desc.to_string(),
        manufacturer: "siemens".to_string(),
        study_date: Some("20240101".to_string()),
        study_time: None,
        acq_time: None,
        contrast_agent: None,
    }
}

pub fn dummy_meta_timed(desc: &str, time: f64) -> SeriesMeta {
    let mut meta = dummy_meta(desc);
    meta.acq_time = Some(time);
    meta
}

/// Creates a study holding one constant-valued raw volume per listed
/// channel, each tagged with its fill value for later identification.
pub fn dummy_study(date: &str, channels: &[(Stage, Channel, f32)]) -> Study {
    let mut study = Study::new(date);
    for &(stage, channel, fill) in channels {
        study
            .store
            .fill(stage, channel, SlotData::new(dummy_volume([6, 6, 6], fill), None));
    }
    study
}

/// Decoder that serves pre-registered arrays instead of reading slices.
#[derive(Default)]
pub struct MockDecoder {
    pub series: HashMap<PathBuf, RawSeries>,
}

impl MockDecoder {
    pub fn with(mut self, dir: impl Into<PathBuf>, series: RawSeries) -> Self {
        self.series.insert(dir.into(), series);
        self
    }
}

impl DecoderEngine for MockDecoder {
    fn decode(&self, series_dir: &Path, _manufacturer: &str) -> Result<RawSeries> {
        self.series
            .get(series_dir)
            .cloned()
            .ok_or_else(|| ProcessError::decode(series_dir, "no series registered in mock"))
    }
}

struct MockTransform {
    moving_tag: f32,
}

/// Registration stand-in. Warping pulls the moving volume onto the fixed
/// grid with nearest sampling; every handle remembers the first voxel of
/// its moving volume so tests can tell which transform got re-applied.
#[derive(Default)]
pub struct MockRegistration {
    pub fail_register: bool,
    pub fail_apply: bool,
    /// When set, apply_transform fails for moving volumes of this shape.
    pub fail_apply_for_shape: Option<[usize; 3]>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RegistrationEngine for MockRegistration {
    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        family: TransformFamily,
    ) -> Result<(Volume, TransformHandle)> {
        if self.fail_register {
            return Err(ProcessError::Registration("mock register failure".into()));
        }
        let tag = moving.data.first().copied().unwrap_or(0.0);
        self.calls
            .lock()
            .unwrap()
            .push(format!("register {family:?} tag={tag}"));
        let warped = GridResampler.resample_to_grid(
            moving,
            fixed.shape(),
            &fixed.affine,
            Interpolation::Nearest,
        )?;
        Ok((warped, TransformHandle::new(MockTransform { moving_tag: tag })))
    }

    fn apply_transform(
        &self,
        handle: &TransformHandle,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<Volume> {
        let stored = handle
            .downcast_ref::<MockTransform>()
            .ok_or_else(|| ProcessError::Registration("foreign handle in mock".into()))?;
        if self.fail_apply || self.fail_apply_for_shape == Some(moving.shape()) {
            return Err(ProcessError::Registration("mock apply failure".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("apply tag={}", stored.moving_tag));
        GridResampler.resample_to_grid(
            moving,
            fixed.shape(),
            &fixed.affine,
            Interpolation::Nearest,
        )
    }
}

/// Extraction stand-in: zeroes the first index plane and reports it outside
/// the mask, leaving the rest untouched.
pub struct MockExtraction;

impl ExtractionEngine for MockExtraction {
    fn extract(&self, volume: &Volume) -> Result<(Volume, Array3<u8>)> {
        if volume.is_empty() {
            return Err(ProcessError::Extraction("empty volume in mock".into()));
        }
        let mut stripped = volume.clone();
        stripped.data.slice_mut(s![0, .., ..]).fill(0.0);
        let mut mask = Array3::<u8>::ones(volume.data.raw_dim());
        mask.slice_mut(s![0, .., ..]).fill(0);
        Ok((stripped, mask))
    }
}

/// A full engine set backed by mocks, with the real resampler.
pub fn mock_engines() -> EngineSet {
    EngineSet {
        decoder: Box::new(MockDecoder::default()),
        resampler: Box::new(GridResampler),
        registration: Box::new(MockRegistration::default()),
        extraction: Box::new(MockExtraction),
    }
}
