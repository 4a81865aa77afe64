use crate::error::{ProcessError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One study directory and the series directories found beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyDirs {
    pub study_dir: PathBuf,
    pub series_dirs: Vec<PathBuf>,
}

/// Scans the upload root for case directories whose name starts with one of
/// the configured prefixes. Returned sorted for deterministic processing.
pub fn find_case_dirs(upload_root: &Path, prefixes: &[String]) -> Result<Vec<PathBuf>> {
    let mut cases = Vec::new();
    for entry in fs::read_dir(upload_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            cases.push(entry.path());
        }
    }
    cases.sort();
    Ok(cases)
}

/// Groups every `*.dcm` slice below `case_dir` by its parent (series) and
/// grandparent (study) directory.
///
/// A slice sitting directly in the case directory has no series level and its
/// study would escape the case, so it is rejected. A series directly under
/// the case directory is fine: the case directory then doubles as the study.
pub fn group_series(case_dir: &Path) -> Result<Vec<StudyDirs>> {
    let mut grouped: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(case_dir) {
        let entry = entry.map_err(|e| ProcessError::Grouping {
            path: case_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() || !is_slice(entry.path()) {
            continue;
        }

        let series_dir = entry.path().parent().unwrap_or(case_dir);
        if series_dir == case_dir {
            return Err(ProcessError::Grouping {
                path: entry.path().to_path_buf(),
                reason: "slice file sits in the case directory, no series level".into(),
            });
        }
        let study_dir = series_dir.parent().unwrap_or(case_dir);

        grouped
            .entry(study_dir.to_path_buf())
            .or_default()
            .insert(series_dir.to_path_buf());
    }

    Ok(grouped
        .into_iter()
        .map(|(study_dir, series)| StudyDirs {
            study_dir,
            series_dirs: series.into_iter().collect(),
        })
        .collect())
}

pub(crate) fn is_slice(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("dcm"))
}
