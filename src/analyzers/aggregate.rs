use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::analyzers::types::{FatvFlowSeries, SideSeries};
use crate::analyzers::utility::nan_mean;
use crate::config::MaskedDetectors;
use crate::fatv::{Fatv, FatvId};
use crate::parser::FlowSample;
use crate::topology::DetectorId;

/// One day of flow samples pivoted into timestamp × detector columns.
///
/// Cells with no sample are NaN. Detectors whose day-mean observed
/// percentage does not exceed the threshold are masked.
#[derive(Debug, Clone)]
pub struct DayFlows {
    timestamps: Vec<NaiveDateTime>,
    flows: BTreeMap<DetectorId, Vec<f64>>,
    observed: BTreeMap<DetectorId, f64>,
    masked: BTreeSet<DetectorId>,
    duplicates: usize,
    policy: MaskedDetectors,
}

impl DayFlows {
    pub fn from_samples(samples: &[FlowSample], min_observed_pct: f64, policy: MaskedDetectors) -> Self {
        let timestamps: Vec<NaiveDateTime> = samples
            .iter()
            .map(|s| s.timestamp)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let slot: BTreeMap<NaiveDateTime, usize> =
            timestamps.iter().enumerate().map(|(i, &t)| (t, i)).collect();

        // Flow and observed% share one cell per slot; a repeated row replaces both.
        let mut cells: BTreeMap<DetectorId, Vec<Option<(f64, f64)>>> = BTreeMap::new();
        let mut duplicates = 0usize;
        for sample in samples {
            let column = cells
                .entry(sample.detector)
                .or_insert_with(|| vec![None; timestamps.len()]);
            let cell = &mut column[slot[&sample.timestamp]];
            if cell.is_some() {
                duplicates += 1;
            }
            *cell = Some((
                sample.flow.unwrap_or(f64::NAN),
                sample.observed.unwrap_or(f64::NAN),
            ));
        }

        let mut flows: BTreeMap<DetectorId, Vec<f64>> = BTreeMap::new();
        let mut observed: BTreeMap<DetectorId, f64> = BTreeMap::new();
        for (d, column) in cells {
            let kept: Vec<f64> = column.iter().flatten().map(|&(_, pct)| pct).collect();
            observed.insert(d, nan_mean(&kept));
            flows.insert(d, column.iter().map(|c| c.map_or(f64::NAN, |(flow, _)| flow)).collect());
        }

        // A NaN mean fails the comparison, so it is masked too.
        let masked: BTreeSet<DetectorId> = observed
            .iter()
            .filter(|&(_, &pct)| !(pct > min_observed_pct))
            .map(|(&d, _)| d)
            .collect();

        debug!(
            timestamps = timestamps.len(),
            detectors = flows.len(),
            masked = masked.len(),
            duplicates,
            "Pivoted day flows"
        );

        Self {
            timestamps,
            flows,
            observed,
            masked,
            duplicates,
            policy,
        }
    }

    /// Every detector reporting in the day's table, ascending.
    pub fn universe(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.flows.keys().copied()
    }

    pub fn contains(&self, detector: DetectorId) -> bool {
        self.flows.contains_key(&detector)
    }

    /// Detectors masked for insufficient observation.
    pub fn masked(&self) -> &BTreeSet<DetectorId> {
        &self.masked
    }

    pub fn observed_pct(&self, detector: DetectorId) -> Option<f64> {
        self.observed.get(&detector).copied()
    }

    /// Rows that repeated an earlier (timestamp, detector) pair.
    pub fn duplicate_rows(&self) -> usize {
        self.duplicates
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    /// Day total over a set of detectors with strict NaN propagation.
    ///
    /// NaN when the set is empty, when any detector is missing from the day,
    /// or when any contributing cell is NaN. Masked detectors either poison
    /// the sum or are skipped, per [`MaskedDetectors`].
    pub fn side_total(&self, detectors: &[DetectorId]) -> f64 {
        let mut total = 0.0;
        let mut counted = 0usize;
        for d in detectors {
            let Some(column) = self.flows.get(d) else {
                return f64::NAN;
            };
            if self.masked.contains(d) {
                match self.policy {
                    MaskedDetectors::Propagate => return f64::NAN,
                    MaskedDetectors::Exclude => continue,
                }
            }
            total += column.iter().sum::<f64>();
            counted += 1;
        }
        if counted == 0 {
            return f64::NAN;
        }
        total
    }

    /// `(IN_total, OUT_total)` of a FATV.
    pub fn fatv_totals(&self, fatv: &Fatv) -> (f64, f64) {
        (self.side_total(&fatv.inbound), self.side_total(&fatv.outbound))
    }

    /// Per-timestamp IN and OUT sums of a FATV, unmasked.
    pub fn series(&self, id: FatvId, fatv: &Fatv) -> FatvFlowSeries {
        FatvFlowSeries {
            fatv: id,
            x: self.timestamps.clone(),
            inbound: self.side_series(&fatv.inbound),
            outbound: self.side_series(&fatv.outbound),
        }
    }

    fn side_series(&self, detectors: &[DetectorId]) -> SideSeries {
        let columns: Vec<Option<&Vec<f64>>> = detectors.iter().map(|d| self.flows.get(d)).collect();
        let y = (0..self.timestamps.len())
            .map(|t| {
                let sum = columns
                    .iter()
                    .map(|c| c.map_or(f64::NAN, |c| c[t]))
                    .sum::<f64>();
                (!detectors.is_empty() && sum.is_finite()).then_some(sum)
            })
            .collect();

        SideSeries {
            detectors: detectors.to_vec(),
            y,
        }
    }
}
