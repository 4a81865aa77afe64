pub mod rules;

use crate::error::{ProcessError, Result};
use crate::io::store::{Channel, Stage};
use dicom::core::Tag;
use dicom::object::{open_file, DefaultDicomObject};
use dicom_dictionary_std::tags;
use log::debug;
use rules::{first_match, t1_channel, RuleOutcome, SeriesMeta};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// ContrastBolusAgent is often left empty; Siemens consoles park the agent
// string in RequestedContrastAgent instead.
const REQUESTED_CONTRAST_AGENT: Tag = Tag(0x0032, 0x1070);

/// A classified series: which slot it fills and the metadata it was
/// classified from.
#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub stage: Stage,
    pub channel: Channel,
    pub meta: SeriesMeta,
}

/// Reads the classification metadata of a series from its first slice.
pub fn read_series_meta(series_dir: &Path) -> Result<SeriesMeta> {
    let slice = first_slice(series_dir)?;
    let obj = open_file(&slice)?;

    let description = string_tag(&obj, tags::SERIES_DESCRIPTION)
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    let manufacturer = string_tag(&obj, tags::MANUFACTURER).unwrap_or_default();
    let study_date = string_tag(&obj, tags::STUDY_DATE);
    let study_time = string_tag(&obj, tags::STUDY_TIME).and_then(|t| parse_dicom_time(&t));
    let acq_time = string_tag(&obj, tags::ACQUISITION_TIME)
        .or_else(|| string_tag(&obj, tags::SERIES_TIME))
        .and_then(|t| parse_dicom_time(&t));
    let contrast_agent = string_tag(&obj, tags::CONTRAST_BOLUS_AGENT)
        .or_else(|| string_tag(&obj, REQUESTED_CONTRAST_AGENT))
        .map(|s| s.to_lowercase());

    Ok(SeriesMeta {
        series_dir: series_dir.to_path_buf(),
        description,
        manufacturer,
        study_date,
        study_time,
        acq_time,
        contrast_agent,
    })
}

/// Maps every series of a study to a (stage, channel) slot.
///
/// Runs in two passes: the first settles everything except FLAIR, recording
/// the earliest post-contrast T1 acquisition time along the way; the second
/// promotes FLAIR series acquired after that time to flair+. Two series
/// claiming the same slot fail the study.
pub fn classify_series(metas: Vec<SeriesMeta>) -> Result<Vec<SeriesRecord>> {
    let mut records = Vec::new();
    let mut tentative = Vec::new();
    let mut t1gd_time = f64::INFINITY;

    for meta in metas {
        let Some(rule) = first_match(&meta) else {
            debug!("series '{}' matched no rule, ignored", meta.description);
            continue;
        };
        match rule.outcome {
            RuleOutcome::Skip => {
                debug!("series '{}' skipped ({})", meta.description, rule.name);
            }
            RuleOutcome::Definite(stage, channel) => {
                records.push(SeriesRecord {
                    stage,
                    channel,
                    meta,
                });
            }
            RuleOutcome::T1Contrast => {
                let channel = t1_channel(meta.contrast_agent.as_deref(), &meta.description);
                if channel == Channel::T1Gd {
                    if let Some(t) = meta.acq_time {
                        t1gd_time = t1gd_time.min(t);
                    }
                }
                records.push(SeriesRecord {
                    stage: Stage::Raw,
                    channel,
                    meta,
                });
            }
            RuleOutcome::TentativeFlair => tentative.push(meta),
        }
    }

    for meta in tentative {
        // a FLAIR with no usable time is taken as pre-contrast
        let channel = match meta.acq_time {
            Some(t) if t > t1gd_time => Channel::FlairGd,
            _ => Channel::Flair,
        };
        records.push(SeriesRecord {
            stage: Stage::Raw,
            channel,
            meta,
        });
    }

    let mut claimed: HashMap<(Stage, Channel), String> = HashMap::new();
    for record in &records {
        let key = (record.stage, record.channel);
        if let Some(existing) = claimed.insert(key, record.meta.description.clone()) {
            return Err(ProcessError::DuplicateChannel {
                channel: record.channel,
                existing,
                incoming: record.meta.description.clone(),
            });
        }
    }

    Ok(records)
}

/// DICOM TM value as seconds after midnight. TM allows truncation, so
/// "HH" and "HHMM" are as valid as the full "HHMMSS.FFFFFF".
pub fn parse_dicom_time(raw: &str) -> Option<f64> {
    let t = raw.trim();
    let hours: f64 = t.get(0..2)?.parse().ok()?;
    let minutes: f64 = match t.len() {
        2 => 0.0,
        3 => return None,
        _ => t.get(2..4)?.parse().ok()?,
    };
    let seconds: f64 = if t.len() > 4 {
        t.get(4..)?.parse().ok()?
    } else {
        0.0
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn first_slice(series_dir: &Path) -> Result<std::path::PathBuf> {
    let mut slices: Vec<_> = fs::read_dir(series_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("dcm"))
        })
        .collect();
    slices.sort();
    slices
        .into_iter()
        .next()
        .ok_or_else(|| ProcessError::decode(series_dir, "series directory holds no slices"))
}

fn string_tag(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
