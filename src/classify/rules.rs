use crate::io::store::{Channel, Stage};
use std::path::PathBuf;

/// Normalized metadata of one series, pulled from its first slice.
/// Free-text fields are lowercased before any rule sees them.
#[derive(Debug, Clone)]
pub struct SeriesMeta {
    pub series_dir: PathBuf,
    pub description: String,
    pub manufacturer: String,
    pub study_date: Option<String>,
    /// StudyTime in seconds after midnight.
    pub study_time: Option<f64>,
    /// AcquisitionTime in seconds after midnight, falling back to SeriesTime.
    pub acq_time: Option<f64>,
    /// ContrastBolusAgent, falling back to RequestedContrastAgent.
    pub contrast_agent: Option<String>,
}

/// What a matched rule decides about a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Series is dropped (reformats and the like).
    Skip,
    /// Series maps straight to a slot.
    Definite(Stage, Channel),
    /// T1-weighted; pre/post contrast is decided by the contrast agent tags.
    T1Contrast,
    /// FLAIR-like; pre/post contrast is decided against the post-contrast T1
    /// acquisition time in a second pass.
    TentativeFlair,
}

/// One entry of the classification cascade.
pub struct Rule {
    pub name: &'static str,
    pub applies: fn(&SeriesMeta) -> bool,
    pub outcome: RuleOutcome,
}

/// The cascade, in priority order. The first matching rule wins; a series
/// matching none is ignored.
///
/// Order is load-bearing: FLAIR series descriptions routinely contain "t2",
/// so the FLAIR rule must run before the T2 rule, and derived maps (trace,
/// rCBV, ADC) must outrank the anatomical rules.
pub const RULES: &[Rule] = &[
    Rule {
        name: "mpr reformat",
        applies: |m| is_mpr_reformat(&m.description),
        outcome: RuleOutcome::Skip,
    },
    Rule {
        name: "diffusion trace",
        applies: |m| m.description.contains("tracew"),
        outcome: RuleOutcome::Definite(Stage::Raw, Channel::Dwi),
    },
    Rule {
        name: "perfusion rcbv",
        applies: |m| m.description.contains("relccbv"),
        outcome: RuleOutcome::Definite(Stage::Cbv, Channel::Flair),
    },
    Rule {
        name: "adc map",
        applies: |m| m.description.contains("adc"),
        outcome: RuleOutcome::Definite(Stage::Adc, Channel::Dwi),
    },
    Rule {
        name: "flair",
        applies: |m| m.description.contains("flair") || m.description.contains("fluid"),
        outcome: RuleOutcome::TentativeFlair,
    },
    Rule {
        name: "t2",
        applies: |m| m.description.contains("t2"),
        outcome: RuleOutcome::Definite(Stage::Raw, Channel::T2),
    },
    Rule {
        name: "t1",
        applies: |m| m.description.contains("t1"),
        outcome: RuleOutcome::T1Contrast,
    },
];

pub fn first_match(meta: &SeriesMeta) -> Option<&'static Rule> {
    RULES.iter().find(|rule| (rule.applies)(meta))
}

/// True for multiplanar reformat series, which duplicate an acquisition and
/// must not compete with it. Matches "mpr" followed by three characters that
/// are not "a", "g", "e" respectively, so "mprage" stays classifiable.
pub fn is_mpr_reformat(description: &str) -> bool {
    let b = description.as_bytes();
    if b.len() < 6 {
        return false;
    }
    for i in 0..=b.len() - 6 {
        if &b[i..i + 3] == b"mpr" && b[i + 3] != b'a' && b[i + 4] != b'g' && b[i + 5] != b'e' {
            return true;
        }
    }
    false
}

/// Pre/post contrast decision for a T1-weighted series. A populated contrast
/// agent tag settles it outright. Without one the description decides: "pre"
/// wins, then the usual vendor post markers; Philips often populates neither,
/// in which case the series is taken as pre-contrast.
pub fn t1_channel(contrast_agent: Option<&str>, description: &str) -> Channel {
    const POST_MARKERS: [&str; 4] = ["post", "gad", " c ", "_c_"];
    if contrast_agent.is_some_and(|agent| !agent.is_empty()) {
        Channel::T1Gd
    } else if description.contains("pre") {
        Channel::T1
    } else if POST_MARKERS.iter().any(|marker| description.contains(marker)) {
        Channel::T1Gd
    } else {
        Channel::T1
    }
}
