pub mod align_between;
pub mod align_within;
pub mod merge;
