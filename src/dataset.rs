use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;

use crate::channel_config::Channel;
use crate::driver::Resolution;

pub const TIME_COLUMN_NAME: &str = "time";
const MIN_COLUMN_SUFFIX: &str = "_min";

/// Calibrated traces of one segment (or one stream) with their time axis.
///
/// Voltages are in millivolts, times in seconds from the first stored sample.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformDataset {
    segment: u32,
    resolution: Resolution,
    sample_interval_s: f64,
    time_s: Vec<f64>,
    traces: BTreeMap<Channel, Vec<f64>>,
    minimums: BTreeMap<Channel, Vec<f64>>,
    overflow: BTreeSet<Channel>,
    pre_trigger_samples: u64,
    trigger_index: Option<u64>,
}

impl WaveformDataset {
    pub(crate) fn new(
        segment: u32,
        resolution: Resolution,
        sample_interval_s: f64,
        traces: BTreeMap<Channel, Vec<f64>>,
        minimums: BTreeMap<Channel, Vec<f64>>,
        overflow: BTreeSet<Channel>,
        pre_trigger_samples: u64,
        trigger_index: Option<u64>,
    ) -> Self {
        let len = traces.values().map(Vec::len).max().unwrap_or(0);
        let time_s = (0..len).map(|i| i as f64 * sample_interval_s).collect();
        Self {
            segment,
            resolution,
            sample_interval_s,
            time_s,
            traces,
            minimums,
            overflow,
            pre_trigger_samples,
            trigger_index,
        }
    }

    pub fn len(&self) -> usize {
        self.time_s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_s.is_empty()
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn sample_interval_s(&self) -> f64 {
        self.sample_interval_s
    }

    pub fn time(&self) -> &[f64] {
        &self.time_s
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.traces.keys().copied()
    }

    pub fn trace(&self, channel: Channel) -> Option<&[f64]> {
        self.traces.get(&channel).map(Vec::as_slice)
    }

    /// Window minima of an aggregated capture.
    pub fn minimum_trace(&self, channel: Channel) -> Option<&[f64]> {
        self.minimums.get(&channel).map(Vec::as_slice)
    }

    pub fn is_overflowed(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn overflowed_channels(&self) -> &BTreeSet<Channel> {
        &self.overflow
    }

    pub fn pre_trigger_samples(&self) -> u64 {
        self.pre_trigger_samples
    }

    pub fn trigger_index(&self) -> Option<u64> {
        self.trigger_index
    }

    /// One `time` column plus one millivolt column per channel (`A`, `A_min`, ...).
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("WaveformDataset::to_dataframe");

        let mut columns: Vec<Column> = Vec::with_capacity(1 + self.traces.len() + self.minimums.len());
        columns.push(Column::new(TIME_COLUMN_NAME.into(), self.time_s.as_slice()));
        for (channel, trace) in &self.traces {
            columns.push(Column::new(channel.as_str().into(), trace.as_slice()));
        }
        for (channel, trace) in &self.minimums {
            let name = format!("{}{}", channel.as_str(), MIN_COLUMN_SUFFIX);
            columns.push(Column::new(name.into(), trace.as_slice()));
        }
        DataFrame::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> WaveformDataset {
        WaveformDataset::new(
            2,
            Resolution::Bits8,
            1e-6,
            [
                (Channel::A, vec![0.0, 1.0, 2.0]),
                (Channel::B, vec![-1.0, -2.0, -3.0]),
            ]
            .into_iter()
            .collect(),
            [(Channel::A, vec![-0.5, 0.5, 1.5])].into_iter().collect(),
            BTreeSet::new(),
            1,
            None,
        )
    }

    #[test]
    fn test_time_axis() {
        let dataset = dataset();
        assert_eq!(dataset.len(), 3);
        assert!((dataset.time()[2] - 2e-6).abs() < 1e-15);
        assert_eq!(dataset.channels().collect::<Vec<_>>(), vec![Channel::A, Channel::B]);
        assert!(!dataset.is_overflowed());
    }

    #[test]
    fn test_to_dataframe() {
        let df = dataset().to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, vec!["time", "A", "B", "A_min"]);

        let b: Vec<f64> = df
            .column("B")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(b, vec![-1.0, -2.0, -3.0]);
    }
}
