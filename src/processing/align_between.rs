use crate::engines::{EngineSet, Interpolation, TransformFamily, TransformHandle};
use crate::error::{ProcessError, Result};
use crate::io::store::{Case, Channel, SlotKey, Stage, Study};
use crate::io::volume::Volume;
use log::{info, warn};

/// Chains every timepoint of a case into the atlas frame.
///
/// Timepoint 0 is registered to the atlas; every later timepoint is
/// registered to timepoint 0's already-aligned reference rather than to the
/// atlas directly, since repeat atlas registrations reproduce with more
/// than a voxel of error. Each timepoint's transform is then propagated to
/// all of its other channels, every affine becoming the atlas affine.
///
/// An atlas registration failure aborts the whole case. A later timepoint
/// that cannot be registered (or has no T1 reference) is dropped from the
/// case; a propagation failure clears just that channel.
pub fn register_timepoints(case: &mut Case, atlas: &Volume, engines: &EngineSet) -> Result<()> {
    resample_to_atlas_voxels(case, atlas, engines)?;

    if case.studies.is_empty() {
        return Err(ProcessError::Registration(format!(
            "case {} has no studies left to align",
            case.case_id
        )));
    }

    // timepoint 0 carries the whole chain, so its failure is fatal
    let tp0 = &mut case.studies[0];
    let ref0_channel = tp0
        .reference_channel()
        .ok_or_else(|| ProcessError::NoReference(tp0.study_date.clone()))?;
    let moving = match tp0.store.get(Stage::Raw, ref0_channel) {
        Some(slot) => slot.volume.clone(),
        None => return Err(ProcessError::NoReference(tp0.study_date.clone())),
    };
    info!(
        "study {}: registering {} to the atlas",
        tp0.study_date, ref0_channel
    );
    let (warped, tx0) = engines
        .registration
        .register(atlas, &moving, TransformFamily::Rigid)
        .map_err(|e| ProcessError::Registration(format!("atlas registration failed: {e}")))?;
    if let Some(slot) = tp0.store.get_mut(Stage::Raw, ref0_channel) {
        // warped into the atlas grid, so the affine is the atlas affine
        slot.volume = warped;
        slot.volume.affine = atlas.affine;
    }
    propagate(tp0, ref0_channel, &tx0, atlas, atlas, engines);

    let reference0 = match case.studies[0].store.get(Stage::Raw, ref0_channel) {
        Some(slot) => slot.volume.clone(),
        None => return Err(ProcessError::NoReference(case.studies[0].study_date.clone())),
    };

    let mut skipped = Vec::new();
    for (index, study) in case.studies.iter_mut().enumerate().skip(1) {
        let Some(ref_channel) = study.reference_channel() else {
            warn!(
                "study {}: no t1/t1+ to register to timepoint 0, skipping this study",
                study.study_date
            );
            skipped.push(index);
            continue;
        };
        let moving = match study.store.get(Stage::Raw, ref_channel) {
            Some(slot) => slot.volume.clone(),
            None => {
                skipped.push(index);
                continue;
            }
        };
        info!(
            "study {}: registering {} to timepoint 0",
            study.study_date, ref_channel
        );
        match engines
            .registration
            .register(&reference0, &moving, TransformFamily::Rigid)
        {
            Ok((warped, tx)) => {
                if let Some(slot) = study.store.get_mut(Stage::Raw, ref_channel) {
                    slot.volume = warped;
                    slot.volume.affine = atlas.affine;
                }
                propagate(study, ref_channel, &tx, &reference0, atlas, engines);
            }
            Err(e) => {
                warn!(
                    "study {}: registration to timepoint 0 failed ({e}), skipping this study",
                    study.study_date
                );
                skipped.push(index);
            }
        }
    }

    for index in skipped.into_iter().rev() {
        case.studies.remove(index);
    }
    Ok(())
}

/// Resamples every populated slot of every study to the atlas voxel sizes,
/// clipping interpolation undershoot.
fn resample_to_atlas_voxels(case: &mut Case, atlas: &Volume, engines: &EngineSet) -> Result<()> {
    let voxel_mm = atlas.voxel_size();
    for study in &mut case.studies {
        for key in study.store.populated() {
            if let Some(slot) = study.store.get_mut(key.stage, key.channel) {
                info!(
                    "study {}: resampling {},{} into atlas voxel space",
                    study.study_date, key.stage, key.channel
                );
                let mut resampled = engines.resampler.resample_to_voxel_size(
                    &slot.volume,
                    voxel_mm,
                    Interpolation::Cubic,
                )?;
                resampled.clamp_min(0.0);
                slot.volume = resampled;
            }
        }
    }
    Ok(())
}

/// Applies one timepoint's transform to every populated slot except the
/// already-warped reference. A slot whose apply fails is cleared rather
/// than left behind with stale geometry.
fn propagate(
    study: &mut Study,
    ref_channel: Channel,
    handle: &TransformHandle,
    fixed: &Volume,
    atlas: &Volume,
    engines: &EngineSet,
) {
    let keys: Vec<SlotKey> = study
        .store
        .populated()
        .into_iter()
        .filter(|key| !(key.stage == Stage::Raw && key.channel == ref_channel))
        .collect();

    for key in keys {
        let moving = match study.store.get(key.stage, key.channel) {
            Some(slot) => slot.volume.clone(),
            None => continue,
        };
        match engines.registration.apply_transform(handle, fixed, &moving) {
            Ok(warped) => {
                if let Some(slot) = study.store.get_mut(key.stage, key.channel) {
                    slot.volume = warped;
                    slot.volume.affine = atlas.affine;
                }
            }
            Err(e) => {
                warn!(
                    "study {}: cannot propagate transform to {},{} ({e}), dropping the channel",
                    study.study_date, key.stage, key.channel
                );
                study.store.clear(key.stage, key.channel);
            }
        }
    }
}

#[cfg(test)]
mod align_between_tests {
    use super::*;
    use crate::engines::resample::GridResampler;
    use crate::utils::test_utils::{
        dummy_study, dummy_volume, MockDecoder, MockExtraction, MockRegistration,
    };

    fn atlas() -> Volume {
        let mut vol = dummy_volume([6, 6, 6], 50.0);
        vol.affine[(0, 3)] = -98.0;
        vol.affine[(1, 3)] = -134.0;
        vol.affine[(2, 3)] = -72.0;
        vol
    }

    fn engines_with(registration: MockRegistration) -> EngineSet {
        EngineSet {
            decoder: Box::new(MockDecoder::default()),
            resampler: Box::new(GridResampler),
            registration: Box::new(registration),
            extraction: Box::new(MockExtraction),
        }
    }

    fn three_timepoint_case() -> Case {
        let mut case = Case::new("M001");
        case.studies.push(dummy_study(
            "20240101",
            &[
                (Stage::Raw, Channel::T1Gd, 1.0),
                (Stage::Raw, Channel::Flair, 2.0),
                (Stage::Cbv, Channel::Flair, 3.0),
            ],
        ));
        case.studies.push(dummy_study(
            "20240301",
            &[
                (Stage::Raw, Channel::T1, 4.0),
                (Stage::Raw, Channel::T2, 5.0),
            ],
        ));
        case.studies
            .push(dummy_study("20240501", &[(Stage::Raw, Channel::T1Gd, 6.0)]));
        case
    }

    #[test]
    fn test_all_channels_end_on_the_atlas_affine() -> Result<()> {
        let mut case = three_timepoint_case();
        let atlas = atlas();
        let engines = engines_with(MockRegistration::default());

        register_timepoints(&mut case, &atlas, &engines)?;

        assert_eq!(case.studies.len(), 3);
        for study in &case.studies {
            for key in study.store.populated() {
                let slot = study.store.get(key.stage, key.channel).unwrap();
                assert_eq!(
                    slot.volume.affine, atlas.affine,
                    "study {} slot {},{}",
                    study.study_date, key.stage, key.channel
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_atlas_failure_aborts_the_case() {
        let mut case = three_timepoint_case();
        let engines = engines_with(MockRegistration {
            fail_register: true,
            ..MockRegistration::default()
        });

        let err = register_timepoints(&mut case, &atlas(), &engines).unwrap_err();
        assert!(matches!(err, ProcessError::Registration(_)));
    }

    #[test]
    fn test_tp0_without_reference_aborts_the_case() {
        let mut case = Case::new("M002");
        case.studies
            .push(dummy_study("20240101", &[(Stage::Raw, Channel::T2, 1.0)]));

        let engines = engines_with(MockRegistration::default());
        let err = register_timepoints(&mut case, &atlas(), &engines).unwrap_err();
        assert!(matches!(err, ProcessError::NoReference(_)));
    }

    #[test]
    fn test_later_study_without_reference_is_dropped() -> Result<()> {
        let mut case = three_timepoint_case();
        // strip timepoint 1 down to t2 + flair
        case.studies[1] = dummy_study(
            "20240301",
            &[
                (Stage::Raw, Channel::T2, 4.0),
                (Stage::Raw, Channel::Flair, 5.0),
            ],
        );
        let engines = engines_with(MockRegistration::default());

        register_timepoints(&mut case, &atlas(), &engines)?;

        let dates: Vec<_> = case.studies.iter().map(|s| s.study_date.as_str()).collect();
        assert_eq!(dates, vec!["20240101", "20240501"]);
        // the survivors are still fully aligned
        let atlas = atlas();
        for study in &case.studies {
            for key in study.store.populated() {
                let slot = study.store.get(key.stage, key.channel).unwrap();
                assert_eq!(slot.volume.affine, atlas.affine);
            }
        }
        Ok(())
    }

    #[test]
    fn test_failed_propagation_clears_the_channel() -> Result<()> {
        let mut case = Case::new("M003");
        case.studies.push(dummy_study(
            "20240101",
            &[(Stage::Raw, Channel::T1, 1.0)],
        ));
        let mut tp1 = dummy_study("20240301", &[(Stage::Raw, Channel::T1, 2.0)]);
        // an odd-shaped flair the mock refuses to warp
        tp1.store.fill(
            Stage::Raw,
            Channel::Flair,
            crate::io::store::SlotData::new(dummy_volume([3, 3, 3], 7.0), None),
        );
        case.studies.push(tp1);

        let engines = engines_with(MockRegistration {
            // after atlas-voxel resampling the flair keeps its 3^3 shape
            fail_apply_for_shape: Some([3, 3, 3]),
            ..MockRegistration::default()
        });

        register_timepoints(&mut case, &atlas(), &engines)?;

        assert_eq!(case.studies.len(), 2);
        let tp1 = &case.studies[1];
        assert!(tp1.store.is_filled(Stage::Raw, Channel::T1));
        // no stale geometry: the channel is gone, not left behind
        assert!(!tp1.store.is_filled(Stage::Raw, Channel::Flair));
        Ok(())
    }

    #[test]
    fn test_tp0_transform_is_reused_for_its_channels() -> Result<()> {
        let mut case = Case::new("M004");
        case.studies.push(dummy_study(
            "20240101",
            &[
                (Stage::Raw, Channel::T1, 1.0),
                (Stage::Raw, Channel::T2, 2.0),
            ],
        ));
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let engines = engines_with(MockRegistration {
            calls: calls.clone(),
            ..MockRegistration::default()
        });

        register_timepoints(&mut case, &atlas(), &engines)?;

        let log = calls.lock().unwrap();
        // one atlas registration of the t1, one re-applied warp for the t2
        assert_eq!(log.iter().filter(|c| c.starts_with("register")).count(), 1);
        assert!(log.iter().any(|c| c == "apply tag=1"), "calls: {log:?}");
        Ok(())
    }
}
