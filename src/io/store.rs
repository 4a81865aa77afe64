use super::volume::Volume;
use ndarray::Array3;
use std::fmt;

/// Processing stage of a stored volume.
///
/// `Raw` and `Zscore` keep one slot per channel. `Cbv` and `Adc` are derived
/// maps that exist at most once per study; every channel name is an alias for
/// the same slot, with a canonical channel used when enumerating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Raw,
    Zscore,
    Cbv,
    Adc,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Raw, Stage::Zscore, Stage::Cbv, Stage::Adc];

    /// Channel under which a shared stage is enumerated and written.
    /// rCBV maps arrive through FLAIR-aliased perfusion series, ADC maps
    /// through diffusion series.
    pub fn canonical_channel(&self) -> Option<Channel> {
        match self {
            Stage::Cbv => Some(Channel::Flair),
            Stage::Adc => Some(Channel::Dwi),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Stage::Raw => "raw",
                Stage::Zscore => "z",
                Stage::Cbv => "cbv",
                Stage::Adc => "adc",
            }
        )
    }
}

/// MR contrast channel of an acquired series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    T1,
    T1Gd,
    T2,
    Flair,
    FlairGd,
    Dwi,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::T1,
        Channel::T1Gd,
        Channel::T2,
        Channel::Flair,
        Channel::FlairGd,
        Channel::Dwi,
    ];

    fn idx(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Channel::T1 => "t1",
                Channel::T1Gd => "t1+",
                Channel::T2 => "t2",
                Channel::Flair => "flair",
                Channel::FlairGd => "flair+",
                Channel::Dwi => "dwi",
            }
        )
    }
}

/// Address of one stored volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub stage: Stage,
    pub channel: Channel,
}

/// Everything a populated slot carries. Occupancy is expressed by
/// `Option<SlotData>` in the store, so a volume and its metadata can never
/// exist half-initialized.
#[derive(Debug, Clone)]
pub struct SlotData {
    pub volume: Volume,
    /// Acquisition time in seconds after midnight, when the series had one.
    pub time: Option<f64>,
    pub mask: Option<Array3<u8>>,
    /// Intensity extremes at fill time, with display window/level derived
    /// from the maximum.
    pub min: f32,
    pub max: f32,
    pub window: f32,
    pub level: f32,
}

impl SlotData {
    pub fn new(volume: Volume, time: Option<f64>) -> Self {
        let (vmin, vmax) = if volume.is_empty() {
            (0.0, 0.0)
        } else {
            volume.value_range()
        };
        SlotData {
            volume,
            time,
            mask: None,
            min: vmin,
            max: vmax,
            window: vmax / 2.0,
            level: vmax / 4.0,
        }
    }
}

/// Per-study container of volumes, keyed by (stage, channel).
#[derive(Debug, Clone, Default)]
pub struct ChannelStore {
    raw: [Option<SlotData>; 6],
    zscore: [Option<SlotData>; 6],
    cbv: Option<SlotData>,
    adc: Option<SlotData>,
}

impl ChannelStore {
    pub fn new() -> Self {
        ChannelStore::default()
    }

    pub fn get(&self, stage: Stage, channel: Channel) -> Option<&SlotData> {
        match stage {
            Stage::Raw => self.raw[channel.idx()].as_ref(),
            Stage::Zscore => self.zscore[channel.idx()].as_ref(),
            Stage::Cbv => self.cbv.as_ref(),
            Stage::Adc => self.adc.as_ref(),
        }
    }

    pub fn get_mut(&mut self, stage: Stage, channel: Channel) -> Option<&mut SlotData> {
        match stage {
            Stage::Raw => self.raw[channel.idx()].as_mut(),
            Stage::Zscore => self.zscore[channel.idx()].as_mut(),
            Stage::Cbv => self.cbv.as_mut(),
            Stage::Adc => self.adc.as_mut(),
        }
    }

    pub fn is_filled(&self, stage: Stage, channel: Channel) -> bool {
        self.get(stage, channel).is_some()
    }

    pub fn fill(&mut self, stage: Stage, channel: Channel, slot: SlotData) {
        match stage {
            Stage::Raw => self.raw[channel.idx()] = Some(slot),
            Stage::Zscore => self.zscore[channel.idx()] = Some(slot),
            Stage::Cbv => self.cbv = Some(slot),
            Stage::Adc => self.adc = Some(slot),
        }
    }

    pub fn clear(&mut self, stage: Stage, channel: Channel) -> Option<SlotData> {
        match stage {
            Stage::Raw => self.raw[channel.idx()].take(),
            Stage::Zscore => self.zscore[channel.idx()].take(),
            Stage::Cbv => self.cbv.take(),
            Stage::Adc => self.adc.take(),
        }
    }

    /// Keys of every occupied slot, in stage-major deterministic order.
    /// Shared slots appear exactly once, under their canonical channel.
    pub fn populated(&self) -> Vec<SlotKey> {
        let mut keys = Vec::new();
        for stage in Stage::ALL {
            match stage.canonical_channel() {
                Some(channel) => {
                    if self.is_filled(stage, channel) {
                        keys.push(SlotKey { stage, channel });
                    }
                }
                None => {
                    for channel in Channel::ALL {
                        if self.is_filled(stage, channel) {
                            keys.push(SlotKey { stage, channel });
                        }
                    }
                }
            }
        }
        keys
    }

    pub fn raw_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|&c| self.is_filled(Stage::Raw, c))
            .collect()
    }

    pub fn missing_raw(&self) -> usize {
        Channel::ALL.len() - self.raw_channels().len()
    }

    /// The reference channel for spatial normalization: t1+ when present,
    /// otherwise t1.
    pub fn reference_channel(&self) -> Option<Channel> {
        if self.is_filled(Stage::Raw, Channel::T1Gd) {
            Some(Channel::T1Gd)
        } else if self.is_filled(Stage::Raw, Channel::T1) {
            Some(Channel::T1)
        } else {
            None
        }
    }
}

/// One imaging session: every series acquired under the same StudyDate.
#[derive(Debug, Clone)]
pub struct Study {
    /// DICOM StudyDate, YYYYMMDD.
    pub study_date: String,
    /// Earliest series acquisition time of the study, seconds after midnight.
    pub study_time: Option<f64>,
    pub store: ChannelStore,
}

impl Study {
    pub fn new(study_date: impl Into<String>) -> Self {
        Study {
            study_date: study_date.into(),
            study_time: None,
            store: ChannelStore::new(),
        }
    }

    pub fn reference_channel(&self) -> Option<Channel> {
        self.store.reference_channel()
    }
}

/// A patient case: all studies of one upload, ordered chronologically after
/// merging.
#[derive(Debug, Clone)]
pub struct Case {
    pub case_id: String,
    pub studies: Vec<Study>,
}

impl Case {
    pub fn new(case_id: impl Into<String>) -> Self {
        Case {
            case_id: case_id.into(),
            studies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::utils::test_utils::{dummy_slot, noise_volume};

    #[test]
    fn test_fill_then_get_roundtrip() {
        let mut store = ChannelStore::new();
        assert!(store.get(Stage::Raw, Channel::T1).is_none());

        store.fill(Stage::Raw, Channel::T1, dummy_slot(4.0, Some(100.0)));

        let slot = store.get(Stage::Raw, Channel::T1).unwrap();
        assert_eq!(slot.time, Some(100.0));
        assert!(store.is_filled(Stage::Raw, Channel::T1));
        assert!(!store.is_filled(Stage::Raw, Channel::T2));
    }

    #[test]
    fn test_window_level_derived_from_peak() {
        let slot = dummy_slot(8.0, None);
        assert_eq!(slot.window, 4.0);
        assert_eq!(slot.level, 2.0);
    }

    #[test]
    fn test_intensity_extremes_recorded_on_fill() {
        let volume = noise_volume([4, 4, 4], 7);
        let (vmin, vmax) = volume.value_range();

        let slot = SlotData::new(volume, None);
        assert_eq!(slot.min, vmin);
        assert_eq!(slot.max, vmax);
        assert_eq!(slot.window, vmax / 2.0);
        assert_eq!(slot.level, vmax / 4.0);
    }

    #[test]
    fn test_shared_stage_aliases_one_slot() {
        let mut store = ChannelStore::new();
        store.fill(Stage::Cbv, Channel::Flair, dummy_slot(1.0, None));

        // every channel resolves to the same shared slot
        for channel in Channel::ALL {
            assert!(store.is_filled(Stage::Cbv, channel));
        }

        // but enumeration lists it once, under the canonical channel
        let cbv_keys: Vec<_> = store
            .populated()
            .into_iter()
            .filter(|k| k.stage == Stage::Cbv)
            .collect();
        assert_eq!(
            cbv_keys,
            vec![SlotKey {
                stage: Stage::Cbv,
                channel: Channel::Flair
            }]
        );
    }

    #[test]
    fn test_clear_empties_slot() {
        let mut store = ChannelStore::new();
        store.fill(Stage::Raw, Channel::Dwi, dummy_slot(1.0, None));
        store.fill(Stage::Adc, Channel::Dwi, dummy_slot(1.0, None));

        assert!(store.clear(Stage::Adc, Channel::Dwi).is_some());
        assert!(!store.is_filled(Stage::Adc, Channel::Dwi));
        assert!(store.is_filled(Stage::Raw, Channel::Dwi));
    }

    #[test]
    fn test_missing_raw_counts_unfilled_channels() {
        let mut store = ChannelStore::new();
        assert_eq!(store.missing_raw(), 6);

        store.fill(Stage::Raw, Channel::T1, dummy_slot(1.0, None));
        store.fill(Stage::Raw, Channel::Flair, dummy_slot(1.0, None));
        assert_eq!(store.missing_raw(), 4);
        assert_eq!(store.raw_channels(), vec![Channel::T1, Channel::Flair]);
    }

    #[test]
    fn test_reference_prefers_post_contrast_t1() {
        let mut store = ChannelStore::new();
        assert_eq!(store.reference_channel(), None);

        store.fill(Stage::Raw, Channel::T1, dummy_slot(1.0, None));
        assert_eq!(store.reference_channel(), Some(Channel::T1));

        store.fill(Stage::Raw, Channel::T1Gd, dummy_slot(1.0, None));
        assert_eq!(store.reference_channel(), Some(Channel::T1Gd));
    }

    #[test]
    fn test_populated_order_is_stage_major() {
        let mut store = ChannelStore::new();
        store.fill(Stage::Adc, Channel::Dwi, dummy_slot(1.0, None));
        store.fill(Stage::Raw, Channel::T2, dummy_slot(1.0, None));
        store.fill(Stage::Raw, Channel::T1, dummy_slot(1.0, None));

        let keys = store.populated();
        assert_eq!(keys[0].channel, Channel::T1);
        assert_eq!(keys[1].channel, Channel::T2);
        assert_eq!(keys[2].stage, Stage::Adc);
    }
}
