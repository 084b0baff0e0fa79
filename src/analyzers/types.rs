//! Data types produced by the daily analysis.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::analyzers::grade::FatvStatus;
use crate::analyzers::utility::imbalance_ratio;
use crate::fatv::FatvId;
use crate::topology::DetectorId;

/// Per-day balance metrics of one FATV. One row of the metrics CSV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FatvMetrics {
    pub fatv: FatvId,
    pub in_total: f64,
    pub out_total: f64,
    /// `in_total - out_total`
    pub dif: f64,
    /// `in_total + out_total`
    pub vol: f64,
    /// `|dif| / vol`, NaN when undefined.
    pub err: f64,
    pub status: FatvStatus,
}

impl FatvMetrics {
    /// ERR of this FATV merged with `other`: differences and volumes add up.
    pub fn combined_err(&self, other: &FatvMetrics) -> f64 {
        imbalance_ratio(self.dif + other.dif, self.vol + other.vol)
    }

    pub fn is_observable(&self) -> bool {
        !self.err.is_nan()
    }
}

/// A detector diagnosed as miscounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub detector: DetectorId,
    /// `DIF` of the FATV it leaves minus `DIF` of the FATV it enters.
    pub miscount: Option<f64>,
}

/// Diagnosis of one day. Lists are sorted ascending and a detector appears
/// in at most one of the detector categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub date: NaiveDate,
    /// Detectors implicated by at least two resolving pairings.
    pub error: Vec<ErrorEntry>,
    /// Detectors whose day-mean observed percentage is at or below threshold.
    pub unobv: Vec<DetectorId>,
    /// Detectors of FATVs whose ERR could not be computed.
    pub unknown: Vec<DetectorId>,
    /// Detectors reporting on the feed but absent from the topology.
    pub untracked: Vec<DetectorId>,
    /// Boundary detectors with no FATV on their other side.
    pub singleton: Vec<DetectorId>,
    /// FATVs above the gross imbalance threshold.
    pub imbalanced: Vec<FatvId>,
    /// FATVs with an empty IN or OUT set.
    pub malformed: Vec<FatvId>,
}

impl DiagnosisReport {
    /// Name of the category `detector` was placed in, if any.
    pub fn category_of(&self, detector: DetectorId) -> Option<&'static str> {
        if self.error.iter().any(|e| e.detector == detector) {
            return Some("error");
        }
        [
            ("unobv", &self.unobv),
            ("unknown", &self.unknown),
            ("untracked", &self.untracked),
            ("singleton", &self.singleton),
        ]
        .into_iter()
        .find(|(_, dets)| dets.binary_search(&detector).is_ok())
        .map(|(name, _)| name)
    }
}

/// Summed flow of one FATV side per timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideSeries {
    pub detectors: Vec<DetectorId>,
    /// `None` where any detector lacks a value.
    pub y: Vec<Option<f64>>,
}

/// Inbound and outbound flow of one FATV over one day, for plotting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FatvFlowSeries {
    pub fatv: FatvId,
    pub x: Vec<NaiveDateTime>,
    #[serde(rename = "IN")]
    pub inbound: SideSeries,
    #[serde(rename = "OUT")]
    pub outbound: SideSeries,
}
