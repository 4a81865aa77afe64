use crate::engines::{ExtractionEngine, RegistrationEngine, TransformFamily, TransformHandle};
use crate::error::{ProcessError, Result};
use crate::io::nifti_io::{load_volume, save_volume};
use crate::io::volume::Volume;
use ndarray::Array3;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// Registration through the ANTs command line. Volumes travel to and from
/// the tools as gzipped NIfTI files in a scratch directory.
pub struct CommandRegistration {
    register_cmd: String,
    apply_cmd: String,
}

/// Payload behind a [`TransformHandle`]: the affine file the registration
/// run produced. The scratch directory rides along so the file survives as
/// long as the handle does.
struct CommandTransform {
    transform: PathBuf,
    _workdir: TempDir,
}

impl CommandRegistration {
    pub fn new(register_cmd: &str, apply_cmd: &str) -> Self {
        CommandRegistration {
            register_cmd: register_cmd.to_string(),
            apply_cmd: apply_cmd.to_string(),
        }
    }
}

/// ANTs `-t` value for a transform family.
fn family_flag(family: TransformFamily) -> &'static str {
    match family {
        TransformFamily::Rigid => "r",
        TransformFamily::Affine => "a",
    }
}

impl RegistrationEngine for CommandRegistration {
    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        family: TransformFamily,
    ) -> Result<(Volume, TransformHandle)> {
        if fixed.is_empty() {
            return Err(ProcessError::Registration("fixed volume is empty".into()));
        }
        if moving.is_empty() {
            return Err(ProcessError::Registration("moving volume is empty".into()));
        }

        let workdir = TempDir::new()?;
        let fixed_path = workdir.path().join("fixed.nii.gz");
        let moving_path = workdir.path().join("moving.nii.gz");
        save_volume(&fixed_path, fixed)?;
        save_volume(&moving_path, moving)?;

        let prefix = workdir.path().join("reg");
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            "3".into(),
            "-t".into(),
            family_flag(family).into(),
            "-f".into(),
        ];
        args.push(fixed_path.into());
        args.push("-m".into());
        args.push(moving_path.into());
        args.push("-o".into());
        args.push(prefix.clone().into());

        run_tool(&self.register_cmd, &args).map_err(ProcessError::Registration)?;

        let warped_path = workdir.path().join("regWarped.nii.gz");
        let transform = workdir.path().join("reg0GenericAffine.mat");
        if !warped_path.exists() {
            return Err(ProcessError::Registration(format!(
                "{} produced no warped image",
                self.register_cmd
            )));
        }
        if !transform.exists() {
            return Err(ProcessError::Registration(format!(
                "{} produced no affine transform",
                self.register_cmd
            )));
        }

        let warped = load_volume(&warped_path)?;
        let handle = TransformHandle::new(CommandTransform {
            transform,
            _workdir: workdir,
        });
        Ok((warped, handle))
    }

    fn apply_transform(
        &self,
        handle: &TransformHandle,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<Volume> {
        let stored = handle.downcast_ref::<CommandTransform>().ok_or_else(|| {
            ProcessError::Registration("transform handle comes from a different engine".into())
        })?;
        if fixed.is_empty() {
            return Err(ProcessError::Registration("fixed volume is empty".into()));
        }
        if moving.is_empty() {
            return Err(ProcessError::Registration("moving volume is empty".into()));
        }

        let workdir = TempDir::new()?;
        let fixed_path = workdir.path().join("fixed.nii.gz");
        let moving_path = workdir.path().join("moving.nii.gz");
        let out_path = workdir.path().join("warped.nii.gz");
        save_volume(&fixed_path, fixed)?;
        save_volume(&moving_path, moving)?;

        let mut args: Vec<OsString> = vec!["-d".into(), "3".into(), "-i".into()];
        args.push(moving_path.into());
        args.push("-r".into());
        args.push(fixed_path.into());
        args.push("-o".into());
        args.push(out_path.clone().into());
        args.push("-t".into());
        args.push(stored.transform.clone().into());

        run_tool(&self.apply_cmd, &args).map_err(ProcessError::Registration)?;

        if !out_path.exists() {
            return Err(ProcessError::Registration(format!(
                "{} produced no output image",
                self.apply_cmd
            )));
        }
        load_volume(&out_path)
    }
}

/// Brain extraction through the HD-BET command line.
pub struct CommandExtraction {
    cmd: String,
}

impl CommandExtraction {
    pub fn new(cmd: &str) -> Self {
        CommandExtraction {
            cmd: cmd.to_string(),
        }
    }
}

impl ExtractionEngine for CommandExtraction {
    fn extract(&self, volume: &Volume) -> Result<(Volume, Array3<u8>)> {
        if volume.is_empty() {
            return Err(ProcessError::Extraction("input volume is empty".into()));
        }

        let workdir = TempDir::new()?;
        let head_path = workdir.path().join("head.nii.gz");
        let stripped_path = workdir.path().join("head_bet.nii.gz");
        let mask_path = workdir.path().join("head_bet_mask.nii.gz");
        save_volume(&head_path, volume)?;

        let mut args: Vec<OsString> = vec!["-i".into()];
        args.push(head_path.into());
        args.push("-o".into());
        args.push(stripped_path.clone().into());

        run_tool(&self.cmd, &args).map_err(ProcessError::Extraction)?;

        if !stripped_path.exists() || !mask_path.exists() {
            return Err(ProcessError::Extraction(format!(
                "{} produced no stripped image or mask",
                self.cmd
            )));
        }

        let stripped = load_volume(&stripped_path)?;
        let mask_volume = load_volume(&mask_path)?;
        if mask_volume.shape() != stripped.shape() {
            return Err(ProcessError::Extraction(
                "mask shape does not match the stripped image".into(),
            ));
        }
        let mask = mask_volume.data.mapv(|v| u8::from(v > 0.5));
        Ok((stripped, mask))
    }
}

/// Checks that a tool can be spawned and reacts to `-h`.
pub fn tool_available(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn run_tool(cmd: &str, args: &[OsString]) -> std::result::Result<(), String> {
    log::debug!("running {} with {} args", cmd, args.len());
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| format!("{cmd}: {e}"))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    Err(format!("{cmd} exited with {}: {}", output.status, detail.trim()))
}
