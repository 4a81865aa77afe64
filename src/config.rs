use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything one pipeline run needs to know about its surroundings:
/// directory layout, atlas files, and the external tools behind the engine
/// seams. Loaded from TOML; every field has a default so a partial file is
/// fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaseConfig {
    /// Root holding one extracted upload directory per case.
    pub upload_root: PathBuf,
    /// Root the per-case, per-study-date output tree is written under.
    pub out_dir: PathBuf,
    /// Stereotactic atlas volume the whole case is aligned to.
    pub atlas_path: PathBuf,
    /// Brain mask of the atlas, multiplied in before registration.
    pub atlas_mask_path: PathBuf,
    /// Directory name prefixes recognized as case roots.
    pub case_prefixes: Vec<String>,
    /// Run brain extraction on every raw channel; otherwise all-true masks.
    pub extract_brain: bool,
    pub registration_cmd: String,
    pub apply_cmd: String,
    pub extraction_cmd: String,
}

impl Default for CaseConfig {
    fn default() -> Self {
        CaseConfig {
            upload_root: PathBuf::from("upload"),
            out_dir: PathBuf::from("output"),
            atlas_path: PathBuf::from("mni152/mni_icbm152_t1_tal_nlin_sym_09a.nii"),
            atlas_mask_path: PathBuf::from("mni152/mni_icbm152_t1_tal_nlin_sym_09a_mask.nii"),
            case_prefixes: vec!["M".to_string(), "DSC".to_string()],
            extract_brain: false,
            registration_cmd: "antsRegistrationSyNQuick.sh".to_string(),
            apply_cmd: "antsApplyTransforms".to_string(),
            extraction_cmd: "hd-bet".to_string(),
        }
    }
}

impl CaseConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: CaseConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}
