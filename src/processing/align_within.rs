use crate::engines::{EngineSet, Interpolation, TransformFamily};
use crate::error::{ProcessError, Result};
use crate::io::store::{Channel, Stage, Study};
use log::{info, warn};
use ndarray::Array3;

/// Widest CBV-to-reference acquisition gap, in seconds, that still counts
/// as "acquired back to back" and needs no registration of its own.
const CBV_GAP_LIMIT_S: f64 = 600.0;

/// Brings every volume of one study onto the study's own T1 reference:
/// resampling to the reference grid, brain masking, and rigid registration
/// of each raw channel, with the DWI transform re-applied to the ADC map.
///
/// Fails with [`ProcessError::NoReference`] when the study has neither t1
/// nor t1+; a registration engine failure propagates to the caller.
pub fn normalize_study(study: &mut Study, engines: &EngineSet, extract: bool) -> Result<()> {
    let ref_channel = study
        .reference_channel()
        .ok_or_else(|| ProcessError::NoReference(study.study_date.clone()))?;
    let (reference, ref_time) = {
        let slot = study
            .store
            .get(Stage::Raw, ref_channel)
            .ok_or_else(|| ProcessError::NoReference(study.study_date.clone()))?;
        (slot.volume.clone(), slot.time)
    };

    // pull everything onto the reference grid
    for key in study.store.populated() {
        if key.stage == Stage::Raw && key.channel == ref_channel {
            continue;
        }
        if let Some(slot) = study.store.get_mut(key.stage, key.channel) {
            info!(
                "study {}: resampling {},{} into target space",
                study.study_date, key.stage, key.channel
            );
            let mut resampled = engines.resampler.resample_to_grid(
                &slot.volume,
                reference.shape(),
                &reference.affine,
                Interpolation::Cubic,
            )?;
            resampled.clamp_min(0.0);
            slot.volume = resampled;
        }
    }

    // brain masks for every raw channel
    for channel in study.store.raw_channels() {
        if let Some(slot) = study.store.get_mut(Stage::Raw, channel) {
            if extract {
                let (stripped, mask) = engines.extraction.extract(&slot.volume)?;
                slot.volume = stripped;
                slot.mask = Some(mask);
            } else {
                slot.mask = Some(Array3::ones(slot.volume.data.raw_dim()));
            }
        }
    }

    // the ADC map shares the DWI geometry, so the DWI mask applies directly
    if study.store.is_filled(Stage::Adc, Channel::Dwi) {
        let dwi_mask = study
            .store
            .get(Stage::Raw, Channel::Dwi)
            .and_then(|slot| slot.mask.clone());
        if let (Some(mask), Some(adc)) = (dwi_mask, study.store.get_mut(Stage::Adc, Channel::Dwi))
        {
            adc.volume.data.zip_mut_with(&mask, |v, &m| *v *= f32::from(m));
        }
    }

    // rigid registration of each raw channel to the reference; the DWI
    // transform carries over to the ADC map
    for channel in study.store.raw_channels() {
        if channel == ref_channel {
            continue;
        }
        let moving = match study.store.get(Stage::Raw, channel) {
            Some(slot) => slot.volume.clone(),
            None => continue,
        };
        let (warped, handle) =
            engines
                .registration
                .register(&reference, &moving, TransformFamily::Rigid)?;
        if let Some(slot) = study.store.get_mut(Stage::Raw, channel) {
            slot.volume = warped;
        }

        if channel == Channel::Dwi {
            if let Some(adc) = study.store.get(Stage::Adc, Channel::Dwi) {
                let warped_adc =
                    engines
                        .registration
                        .apply_transform(&handle, &reference, &adc.volume)?;
                if let Some(adc) = study.store.get_mut(Stage::Adc, Channel::Dwi) {
                    adc.volume = warped_adc;
                }
            }
        }
    }

    // a CBV map exported right before the reference scan is already aligned
    if let Some(cbv) = study.store.get(Stage::Cbv, Channel::Flair) {
        match (ref_time, cbv.time) {
            (Some(t_ref), Some(t_cbv)) => {
                let gap = t_ref - t_cbv;
                info!("study {}: CBV-t1 time: {gap:.0}", study.study_date);
                if !cbv_assumed_aligned(gap) {
                    warn!(
                        "study {}: CBV registration might be needed but is not being attempted",
                        study.study_date
                    );
                }
            }
            _ => warn!(
                "study {}: CBV or reference acquisition time missing, alignment unverified",
                study.study_date
            ),
        }
    }

    Ok(())
}

/// The timing heuristic behind the CBV policy: a map acquired within the
/// gap limit before the reference needs no registration. Anything else is
/// flagged by the caller but deliberately left untouched.
pub fn cbv_assumed_aligned(gap_s: f64) -> bool {
    gap_s > 0.0 && gap_s < CBV_GAP_LIMIT_S
}
