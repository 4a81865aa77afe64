use crate::io::store::Channel;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a raw case upload into registered volumes.
///
/// Grouping, vendor and geometry errors are fatal to the series or study that
/// raised them; the surrounding stage decides whether the case survives.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot group '{}': {reason}", path.display())]
    Grouping { path: PathBuf, reason: String },

    #[error("unsupported vendor '{0}'")]
    UnsupportedVendor(String),

    #[error("unsupported geometry in '{}': {reason}", series.display())]
    UnsupportedGeometry { series: PathBuf, reason: String },

    #[error("series '{incoming}' maps to channel '{channel}' already claimed by '{existing}'")]
    DuplicateChannel {
        channel: Channel,
        existing: String,
        incoming: String,
    },

    #[error("study {0} has no t1 or t1+ volume to act as reference")]
    NoReference(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("brain extraction failed: {0}")]
    Extraction(String),

    #[error("cannot decode series '{}': {reason}", series.display())]
    Decode { series: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM read error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("summary serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

impl ProcessError {
    pub fn decode(series: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ProcessError::Decode {
            series: series.into(),
            reason: reason.into(),
        }
    }

    pub fn geometry(series: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ProcessError::UnsupportedGeometry {
            series: series.into(),
            reason: reason.into(),
        }
    }
}
