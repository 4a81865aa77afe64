pub mod discover;
pub mod nifti_io;
pub mod output;
pub mod store;
pub mod volume;

use crate::classify::{self, SeriesRecord};
use crate::engines::{DecoderEngine, RawSeries};
use crate::error::{ProcessError, Result};
use crate::io::discover::StudyDirs;
use crate::io::store::{Channel, SlotData, Stage, Study};
use crate::io::volume::Volume;
use log::{info, warn};
use ndarray::{Axis, Ix3};

/// Which stacked volume of a multi-volume diffusion trace is kept: the
/// higher b-value image.
const TRACE_VOLUME_INDEX: usize = 1;

/// Loads one study directory: classifies every series, decodes the
/// recognized ones and files them into a fresh [`Study`].
///
/// Per-series decode failures (unknown vendor, odd geometry, broken files)
/// skip that series and keep the study; a classification conflict fails the
/// whole study.
pub fn load_study(dirs: &StudyDirs, decoder: &dyn DecoderEngine) -> Result<Study> {
    let mut metas = Vec::new();
    for series_dir in &dirs.series_dirs {
        match classify::read_series_meta(series_dir) {
            Ok(meta) => metas.push(meta),
            Err(e) => warn!("cannot read series '{}': {e}", series_dir.display()),
        }
    }

    let mut study_date = None;
    let mut study_time: Option<f64> = None;
    for meta in &metas {
        if study_date.is_none() {
            study_date = meta.study_date.clone();
        }
        if let Some(t) = meta.study_time {
            study_time = Some(study_time.map_or(t, |cur: f64| cur.min(t)));
        }
    }
    let study_date = study_date
        .ok_or_else(|| ProcessError::decode(&dirs.study_dir, "no series carries a StudyDate"))?;

    let records = classify::classify_series(metas)?;

    let mut study = Study::new(study_date);
    study.study_time = study_time;
    for record in records {
        match decode_record(&record, decoder) {
            Ok(volume) => {
                info!(
                    "study {}: series '{}' -> {},{}",
                    study.study_date, record.meta.description, record.stage, record.channel
                );
                study.store.fill(
                    record.stage,
                    record.channel,
                    SlotData::new(volume, record.meta.acq_time),
                );
            }
            Err(e) => warn!(
                "study {}: skipping series '{}': {e}",
                study.study_date, record.meta.description
            ),
        }
    }
    Ok(study)
}

fn decode_record(record: &SeriesRecord, decoder: &dyn DecoderEngine) -> Result<Volume> {
    let raw = decoder.decode(&record.meta.series_dir, &record.meta.manufacturer)?;
    reduce_series(raw, record)
}

/// Brings a decoded series down to 3-D. Multi-volume stacks are only
/// expected for diffusion traces, where a fixed stacked volume is kept.
fn reduce_series(raw: RawSeries, record: &SeriesRecord) -> Result<Volume> {
    let RawSeries { data, affine } = raw;
    match data.ndim() {
        3 => {
            let data = data
                .into_dimensionality::<Ix3>()
                .map_err(|e| ProcessError::geometry(&record.meta.series_dir, e.to_string()))?;
            Ok(Volume::new(data, affine))
        }
        4 => {
            let is_trace = record.stage == Stage::Raw && record.channel == Channel::Dwi;
            let last = Axis(data.ndim() - 1);
            if !is_trace || data.len_of(last) <= TRACE_VOLUME_INDEX {
                return Err(ProcessError::geometry(
                    &record.meta.series_dir,
                    format!("unexpected 4-D series of shape {:?}", data.shape()),
                ));
            }
            let data = data
                .index_axis_move(last, TRACE_VOLUME_INDEX)
                .into_dimensionality::<Ix3>()
                .map_err(|e| ProcessError::geometry(&record.meta.series_dir, e.to_string()))?;
            Ok(Volume::new(data, affine))
        }
        n => Err(ProcessError::geometry(
            &record.meta.series_dir,
            format!("{n}-D series data"),
        )),
    }
}
