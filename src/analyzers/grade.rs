use serde::{Deserialize, Serialize};

use crate::config::Thresholds;

/// Balance state of one FATV for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatvStatus {
    /// ERR could not be computed.
    Unknown,
    Balanced,
    /// Candidate for blame propagation.
    Suspect,
    /// Grossly imbalanced.
    Imbalanced,
}

/// Converts an ERR value into a [`FatvStatus`].
///
/// | ERR                         | Status     |
/// |-----------------------------|------------|
/// | NaN                         | Unknown    |
/// | > `gross_err`               | Imbalanced |
/// | > `candidate_err`           | Suspect    |
/// | otherwise                   | Balanced   |
pub fn grade(err: f64, thresholds: &Thresholds) -> FatvStatus {
    match err {
        e if e.is_nan() => FatvStatus::Unknown,
        e if e > thresholds.gross_err => FatvStatus::Imbalanced,
        e if e > thresholds.candidate_err => FatvStatus::Suspect,
        _ => FatvStatus::Balanced,
    }
}
