use chrono::{Duration, NaiveDate};
use flow_balance::analyzers::aggregate::DayFlows;
use flow_balance::analyzers::diagnose::ImbalanceDiagnoser;
use flow_balance::analyzers::grade::FatvStatus;
use flow_balance::config::{MaskedDetectors, Thresholds};
use flow_balance::fatv::{Fatv, FatvTable};
use flow_balance::parser::FlowSample;
use flow_balance::topology::DetectorId;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

const MAINLINE: DetectorId = 710_000;
const RAMP: DetectorId = 720_000;

/// A corridor of merges: FATV k takes mainline k and ramp k into mainline k+1.
fn corridor(merges: usize) -> FatvTable {
    FatvTable::from_fatvs((0..merges).map(|k| Fatv {
        inbound: vec![MAINLINE + k as u64, RAMP + k as u64],
        outbound: vec![MAINLINE + k as u64 + 1],
    }))
}

/// Flows satisfying conservation at every merge, one column per interval.
fn conserved_samples(entry: &[u32], ramps: &[Vec<u32>]) -> Vec<FlowSample> {
    let start = NaiveDate::from_ymd_opt(2017, 1, 2)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let mut samples = Vec::new();
    for (t, &head) in entry.iter().enumerate() {
        let timestamp = start + Duration::minutes(5 * t as i64);
        let mut mainline = f64::from(head);
        for (k, ramp) in ramps.iter().enumerate() {
            let ramp_flow = f64::from(ramp[t]);
            for (detector, flow) in [(MAINLINE + k as u64, mainline), (RAMP + k as u64, ramp_flow)] {
                samples.push(FlowSample {
                    timestamp,
                    detector,
                    flow: Some(flow),
                    occupancy: None,
                    observed: Some(100.0),
                });
            }
            mainline += ramp_flow;
        }
        samples.push(FlowSample {
            timestamp,
            detector: MAINLINE + ramps.len() as u64,
            flow: Some(mainline),
            occupancy: None,
            observed: Some(100.0),
        });
    }
    samples
}

fn scenario() -> impl Strategy<Value = (Vec<u32>, Vec<Vec<u32>>)> {
    (1usize..6, 1usize..12).prop_flat_map(|(merges, intervals)| {
        (
            prop::collection::vec(1u32..2_000, intervals),
            prop::collection::vec(prop::collection::vec(0u32..500, intervals), merges),
        )
    })
}

proptest! {
    #[test]
    fn conserved_flows_balance_exactly((entry, ramps) in scenario()) {
        let table = corridor(ramps.len());
        let membership = table.membership();
        let thresholds = Thresholds::default();
        let flows = DayFlows::from_samples(&conserved_samples(&entry, &ramps), 50.0, MaskedDetectors::Propagate);

        let metrics = ImbalanceDiagnoser::new(&table, &membership, &thresholds).metrics(&flows);
        for m in metrics.values() {
            prop_assert_eq!(m.dif, 0.0);
            prop_assert_eq!(m.err, 0.0);
            prop_assert_eq!(m.status, FatvStatus::Balanced);
        }
    }

    #[test]
    fn reports_are_deterministic_and_exclusive(
        (entry, ramps) in scenario(),
        noise in prop::collection::vec((0usize..6, 0.5f64..1.5), 0..3),
    ) {
        let table = corridor(ramps.len());
        let membership = table.membership();
        let thresholds = Thresholds::default();

        let mut samples = conserved_samples(&entry, &ramps);
        for (k, factor) in noise {
            let target = MAINLINE + (k % (ramps.len() + 1)) as u64;
            for s in samples.iter_mut().filter(|s| s.detector == target) {
                s.flow = s.flow.map(|f| f * factor);
            }
        }
        let flows = DayFlows::from_samples(&samples, 50.0, MaskedDetectors::Propagate);
        let tracked: BTreeSet<DetectorId> = table.iter().flat_map(|(_, f)| f.detectors()).collect();
        let date = NaiveDate::from_ymd_opt(2017, 1, 2).unwrap();

        let diagnoser = ImbalanceDiagnoser::new(&table, &membership, &thresholds);
        let first = serde_json::to_vec(&diagnoser.diagnose(date, &flows, &tracked).report).unwrap();
        let second = serde_json::to_vec(&diagnoser.diagnose(date, &flows, &tracked).report).unwrap();
        prop_assert_eq!(&first, &second);

        let report = diagnoser.diagnose(date, &flows, &tracked).report;
        let mut seen = HashSet::new();
        let listed = report
            .error
            .iter()
            .map(|e| e.detector)
            .chain(report.unobv.iter().copied())
            .chain(report.unknown.iter().copied())
            .chain(report.untracked.iter().copied())
            .chain(report.singleton.iter().copied());
        for detector in listed {
            prop_assert!(seen.insert(detector), "detector {} listed twice", detector);
        }
    }
}
