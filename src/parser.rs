//! Decoders for the topology export, daily flow tables and the persisted
//! FATV model files.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use std::io::Read;

use crate::fatv::FatvTable;
use crate::topology::{DetectorId, JunctionId, SectionId};

/// Topology export: junctions, sections and detectors of one model snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyInput {
    #[serde(default)]
    pub junctions: Vec<JunctionRecord>,
    #[serde(default)]
    pub sections: Vec<SectionRecord>,
    #[serde(default)]
    pub detectors: Vec<DetectorRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JunctionRecord {
    pub id: JunctionId,
}

/// A directed road section. A `null` endpoint connects to the exterior.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionRecord {
    pub id: SectionId,
    pub origin: Option<JunctionId>,
    pub destination: Option<JunctionId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorRecord {
    /// External identifier; exports carry it either as a string or a number.
    #[serde(deserialize_with = "external_id")]
    pub id: String,
    pub section_id: SectionId,
    pub first_lane: u32,
    pub last_lane: u32,
    pub start_position: f64,
}

/// One row of a daily flow table.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSample {
    #[serde(rename = "Timestamp", alias = "timestamp", deserialize_with = "timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "Station", alias = "station", alias = "detector")]
    pub detector: DetectorId,
    #[serde(rename = "Flow", alias = "flow")]
    pub flow: Option<f64>,
    #[serde(rename = "Occupancy", alias = "occupancy")]
    pub occupancy: Option<f64>,
    #[serde(rename = "Observed", alias = "observed")]
    pub observed: Option<f64>,
}

const TIMESTAMP_FORMATS: &[&str] = &["%m/%d/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

fn timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

/// Parses the timestamp layouts found in exported flow tables.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn external_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// Decodes a topology export from JSON bytes.
pub fn parse_topology(bytes: &[u8]) -> serde_json::Result<TopologyInput> {
    serde_json::from_slice(bytes)
}

/// Decodes a persisted FATV table (`{"<id>": {"IN": [...], "OUT": [...]}}`).
pub fn parse_fatv_table(bytes: &[u8]) -> serde_json::Result<FatvTable> {
    serde_json::from_slice(bytes)
}

/// Decodes the list of detector ids present in the topology.
pub fn parse_tracked(bytes: &[u8]) -> serde_json::Result<Vec<DetectorId>> {
    serde_json::from_slice(bytes)
}

/// Reads every row of a headered daily flow CSV.
pub fn parse_flows<R: Read>(reader: R) -> csv::Result<Vec<FlowSample>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    rdr.deserialize().collect()
}
