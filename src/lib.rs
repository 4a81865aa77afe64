//! Longitudinal MRI case ingestion: classifies every acquired series of a
//! multi-timepoint case into a modality/contrast channel and chains all
//! timepoints into one stereotactic frame.

pub mod classify;
pub mod config;
pub mod engines;
pub mod entry;
pub mod error;
pub mod io;
pub mod processing;
mod utils;

pub use config::CaseConfig;
pub use engines::EngineSet;
pub use entry::run_case;
pub use error::{ProcessError, Result};
pub use io::store::{Case, Channel, ChannelStore, Stage, Study};
pub use io::volume::Volume;
