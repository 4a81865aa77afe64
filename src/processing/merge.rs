use crate::io::store::{Channel, Stage, Study};
use log::info;

/// Orders studies chronologically and collapses same-date duplicates.
///
/// Within one calendar date the study with the most populated raw channels
/// is kept as primary; every raw channel it lacks is copied over from the
/// other studies of that date, which are then dropped. The copy is strictly
/// additive: primary data is never overwritten. True acquisition order
/// between same-date studies is not modeled, so a rescan never displaces
/// the primary's version of a channel.
pub fn merge_same_date(mut studies: Vec<Study>) -> Vec<Study> {
    // date ascending, then richest (fewest missing raw channels) first
    studies.sort_by(|a, b| {
        a.study_date
            .cmp(&b.study_date)
            .then(a.store.missing_raw().cmp(&b.store.missing_raw()))
    });

    let mut merged: Vec<Study> = Vec::new();
    for study in studies {
        match merged.last_mut() {
            Some(primary) if primary.study_date == study.study_date => {
                info!("multiple studies for {}", study.study_date);
                absorb_raw(primary, study);
            }
            _ => merged.push(study),
        }
    }
    merged
}

fn absorb_raw(primary: &mut Study, subordinate: Study) {
    for channel in Channel::ALL {
        if primary.store.is_filled(Stage::Raw, channel) {
            continue;
        }
        if let Some(slot) = subordinate.store.get(Stage::Raw, channel) {
            primary.store.fill(Stage::Raw, channel, slot.clone());
        }
    }
}
