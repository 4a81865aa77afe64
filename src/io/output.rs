use crate::error::Result;
use crate::io::nifti_io::save_volume;
use crate::io::store::{Case, SlotKey, Stage, Study};
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Downstream-facing description of one written case, stored as `case.json`
/// next to the study directories.
#[derive(Debug, Serialize)]
pub struct CaseSummary {
    pub case: String,
    pub studies: Vec<StudySummary>,
}

#[derive(Debug, Serialize)]
pub struct StudySummary {
    pub date: String,
    pub files: Vec<String>,
}

/// File name of one slot in the output tree. Derived maps drop the channel
/// alias they were stored under.
pub fn slot_filename(key: SlotKey) -> String {
    match key.stage {
        Stage::Raw => format!("{}_processed.nii.gz", key.channel),
        Stage::Zscore => format!("z{}_processed.nii.gz", key.channel),
        Stage::Cbv | Stage::Adc => format!("{}_processed.nii.gz", key.stage),
    }
}

/// Writes every populated slot of every study to
/// `<out_root>/<case>/<study_date>/`, plus the case summary JSON.
pub fn write_case(case: &Case, out_root: &Path) -> Result<CaseSummary> {
    let case_dir = out_root.join(&case.case_id);
    let mut summary = CaseSummary {
        case: case.case_id.clone(),
        studies: Vec::new(),
    };

    for study in &case.studies {
        let study_dir = case_dir.join(&study.study_date);
        fs::create_dir_all(&study_dir)?;

        let mut files = Vec::new();
        for key in study.store.populated() {
            if let Some(slot) = study.store.get(key.stage, key.channel) {
                let name = slot_filename(key);
                save_volume(&study_dir.join(&name), &slot.volume)?;
                files.push(name);
            }
        }
        summary.studies.push(StudySummary {
            date: study.study_date.clone(),
            files,
        });
    }

    let writer = BufWriter::new(File::create(case_dir.join("case.json"))?);
    serde_json::to_writer_pretty(writer, &summary)?;
    info!("case {}: nifti files written", case.case_id);
    Ok(summary)
}

/// Output directory of one study, for callers that consume the tree.
pub fn study_dir(out_root: &Path, case_id: &str, study_date: &str) -> PathBuf {
    out_root.join(case_id).join(study_date)
}
