use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::config::CaseConfig;
use crate::engines::EngineSet;
use crate::error::ProcessError;
use crate::io::nifti_io::load_atlas;
use crate::io::output::{write_case, CaseSummary};
use crate::io::store::Case;
use crate::io::volume::Volume;
use crate::io::{discover, load_study};
use std::path::Path;
use crate::processing::align_between::register_timepoints;
use crate::processing::align_within::normalize_study;
use crate::processing::merge::merge_same_date;

/// Runs the whole pipeline for one case: discover and classify its studies,
/// merge same-date duplicates, normalize each study to its own T1 reference,
/// chain all timepoints into the atlas frame, and write the output tree.
///
/// Per-study failures drop the study and keep going; a grouping problem or
/// an atlas registration failure fails the case, and nothing is written.
pub fn run_case(config: &CaseConfig, case_name: &str, engines: &EngineSet) -> Result<CaseSummary> {
    if !config
        .case_prefixes
        .iter()
        .any(|p| case_name.starts_with(p.as_str()))
    {
        return Err(ProcessError::Grouping {
            path: config.upload_root.join(case_name),
            reason: format!(
                "'{case_name}' does not match a case prefix ({})",
                config.case_prefixes.join(", ")
            ),
        }
        .into());
    }

    let case_dir = config.upload_root.join(case_name);
    let study_dirs = discover::group_series(&case_dir)
        .with_context(|| format!("grouping series of case {case_name}"))?;
    if study_dirs.is_empty() {
        bail!("case {case_name}: no dicom series found under {}", case_dir.display());
    }
    info!("case {case_name}: {} study directories", study_dirs.len());

    let atlas = load_atlas(&config.atlas_path, &config.atlas_mask_path)
        .context("loading the stereotactic atlas")?;

    let mut case = Case::new(case_name);
    for dirs in &study_dirs {
        info!("loading {}", dirs.study_dir.display());
        match load_study(dirs, engines.decoder.as_ref()) {
            Ok(study) => case.studies.push(study),
            Err(e) => warn!(
                "case {case_name}: dropping study {}: {e}",
                dirs.study_dir.display()
            ),
        }
    }
    if case.studies.is_empty() {
        bail!("case {case_name}: no study could be loaded");
    }

    case.studies = merge_same_date(std::mem::take(&mut case.studies));

    let mut kept = Vec::new();
    for mut study in case.studies {
        info!("preprocess case = {case_name},{}", study.study_date);
        match normalize_study(&mut study, engines, config.extract_brain) {
            Ok(()) => kept.push(study),
            Err(ProcessError::NoReference(date)) => {
                warn!("case {case_name}: study {date} has no T1 reference, removed");
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("normalizing study {} of case {case_name}", study.study_date)
                })
            }
        }
    }
    case.studies = kept;
    if case.studies.is_empty() {
        bail!("case {case_name}: no study survived normalization");
    }

    align_and_write(&mut case, &atlas, engines, &config.out_dir)
}

/// Chains the case into the atlas frame, then writes the output tree. The
/// chain runs first in full, so a failed case leaves the output untouched.
fn align_and_write(
    case: &mut Case,
    atlas: &Volume,
    engines: &EngineSet,
    out_dir: &Path,
) -> Result<CaseSummary> {
    register_timepoints(case, atlas, engines)
        .with_context(|| format!("aligning timepoints of case {}", case.case_id))?;
    write_case(case, out_dir).with_context(|| format!("writing output of case {}", case.case_id))
}
