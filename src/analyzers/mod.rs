//! Daily flow-balance analysis.
//!
//! This module pivots one day of detector samples, aggregates inbound and
//! outbound volumes per FATV, grades each FATV's imbalance and propagates
//! blame to individual detectors. [`analyzer`] runs it over files on disk.

pub mod aggregate;
pub mod analyzer;
pub mod diagnose;
pub mod grade;
pub mod types;
pub mod utility;
