//! Attribution of FATV imbalances to individual detectors.
//!
//! A detector shared by two imbalanced FATVs is suspected when merging the
//! two FATVs cancels most of the discrepancy: the error sits on their common
//! boundary. A single such pairing is weak evidence; a detector is only
//! reported once two pairings agree.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::analyzers::aggregate::DayFlows;
use crate::analyzers::grade::grade;
use crate::analyzers::types::{DiagnosisReport, ErrorEntry, FatvMetrics};
use crate::analyzers::utility::imbalance_ratio;
use crate::config::Thresholds;
use crate::fatv::{FatvId, FatvTable, Membership};
use crate::topology::DetectorId;

/// Metrics of every FATV plus the report derived from them.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub metrics: BTreeMap<FatvId, FatvMetrics>,
    pub report: DiagnosisReport,
}

/// Outcome of the neighbor-propagation pass.
#[derive(Debug, Default)]
struct Propagation {
    implicated: BTreeSet<DetectorId>,
    promoted: BTreeSet<DetectorId>,
    singleton: BTreeSet<DetectorId>,
}

pub struct ImbalanceDiagnoser<'a> {
    table: &'a FatvTable,
    membership: &'a Membership,
    thresholds: &'a Thresholds,
}

impl<'a> ImbalanceDiagnoser<'a> {
    pub fn new(table: &'a FatvTable, membership: &'a Membership, thresholds: &'a Thresholds) -> Self {
        Self {
            table,
            membership,
            thresholds,
        }
    }

    /// ERR/DIF/VOL of every FATV for one day.
    pub fn metrics(&self, flows: &DayFlows) -> BTreeMap<FatvId, FatvMetrics> {
        self.table
            .iter()
            .map(|(id, fatv)| {
                let (in_total, out_total) = flows.fatv_totals(fatv);
                let dif = in_total - out_total;
                let vol = in_total + out_total;
                let err = imbalance_ratio(dif, vol);
                let metrics = FatvMetrics {
                    fatv: id,
                    in_total,
                    out_total,
                    dif,
                    vol,
                    err,
                    status: grade(err, self.thresholds),
                };
                (id, metrics)
            })
            .collect()
    }

    /// Runs the full diagnosis of one day. `tracked` holds every detector
    /// present in the topology.
    pub fn diagnose(&self, date: NaiveDate, flows: &DayFlows, tracked: &BTreeSet<DetectorId>) -> Diagnosis {
        let metrics = self.metrics(flows);
        let propagation = self.propagate(&metrics);

        let error: Vec<ErrorEntry> = propagation
            .promoted
            .iter()
            .map(|&detector| ErrorEntry {
                detector,
                miscount: self.miscount(detector, &metrics),
            })
            .collect();

        let mut claimed: BTreeSet<DetectorId> = propagation.promoted.clone();
        let mut claim = |candidates: BTreeSet<DetectorId>| -> Vec<DetectorId> {
            let kept: Vec<DetectorId> = candidates.into_iter().filter(|d| !claimed.contains(d)).collect();
            claimed.extend(kept.iter().copied());
            kept
        };

        let unobv = claim(flows.masked().clone());
        let unknown = claim(
            self.table
                .iter()
                .filter(|(id, _)| metrics.get(id).is_some_and(|m| !m.is_observable()))
                .flat_map(|(_, fatv)| fatv.detectors())
                .collect(),
        );
        let untracked = claim(flows.universe().filter(|d| !tracked.contains(d)).collect());
        let singleton = claim(propagation.singleton);

        let imbalanced: Vec<FatvId> = metrics
            .values()
            .filter(|m| m.err > self.thresholds.gross_err)
            .map(|m| m.fatv)
            .collect();
        let malformed: Vec<FatvId> = self
            .table
            .iter()
            .filter(|(_, fatv)| fatv.is_malformed())
            .map(|(id, _)| id)
            .collect();

        info!(
            date = %date,
            fatvs = metrics.len(),
            imbalanced = imbalanced.len(),
            implicated = propagation.implicated.len(),
            errors = error.len(),
            unobv = unobv.len(),
            unknown = unknown.len(),
            untracked = untracked.len(),
            singleton = singleton.len(),
            "Diagnosis complete"
        );

        Diagnosis {
            metrics,
            report: DiagnosisReport {
                date,
                error,
                unobv,
                unknown,
                untracked,
                singleton,
                imbalanced,
                malformed,
            },
        }
    }

    /// Pairs every candidate FATV with the neighbors sharing its boundary
    /// detectors and records which detectors the pairings implicate.
    fn propagate(&self, metrics: &BTreeMap<FatvId, FatvMetrics>) -> Propagation {
        let mut result = Propagation::default();

        for (&id, candidate) in metrics {
            // NaN never exceeds the threshold.
            if !(candidate.err > self.thresholds.candidate_err) {
                continue;
            }
            let Some(fatv) = self.table.get(id) else {
                continue;
            };

            // Upstream neighbors drain through our IN detectors, downstream
            // neighbors are fed by our OUT detectors.
            let upstream = fatv.inbound.iter().map(|&d| (d, self.membership.outbound_of(d)));
            let downstream = fatv.outbound.iter().map(|&d| (d, self.membership.inbound_of(d)));

            let mut neighbors: Vec<(DetectorId, FatvId)> = Vec::new();
            for (d, opposite) in upstream.chain(downstream) {
                let before = neighbors.len();
                neighbors.extend(opposite.iter().filter(|&&n| n != id).map(|&n| (d, n)));
                if neighbors.len() == before {
                    result.singleton.insert(d);
                }
            }

            for (d, n) in neighbors {
                let Some(neighbor) = metrics.get(&n) else {
                    continue;
                };
                if !(neighbor.err >= self.thresholds.neighbor_min_err) {
                    continue;
                }

                let combined = candidate.combined_err(neighbor);
                if !(combined < self.thresholds.collapse_ratio * candidate.err) {
                    continue;
                }

                info!(neighbor = n, detector = d, fatv = id, combined, "Neighbor implicates detector");
                if !result.implicated.insert(d) {
                    result.promoted.insert(d);
                    for other in [id, n] {
                        if let Some(pair_member) = self.table.get(other) {
                            for cleared in pair_member.detectors() {
                                result.singleton.remove(&cleared);
                            }
                        }
                    }
                }
            }
        }

        debug!(
            implicated = result.implicated.len(),
            promoted = result.promoted.len(),
            "Propagation finished"
        );
        result
    }

    /// DIF of the FATV the detector leaves minus DIF of the FATV it enters.
    fn miscount(&self, detector: DetectorId, metrics: &BTreeMap<FatvId, FatvMetrics>) -> Option<f64> {
        let entered = metrics.get(&self.membership.fatv_in(detector)?)?;
        let left = metrics.get(&self.membership.fatv_out(detector)?)?;
        let miscount = left.dif - entered.dif;
        miscount.is_finite().then_some(miscount)
    }
}
