use thiserror::Error;

use crate::fatv::FatvId;

/// Failures that abort a run instead of degrading into report categories.
#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("Topology not found: {0}")]
    MissingTopology(String),

    #[error("FATV table not found: {0}")]
    MissingFatvTable(String),

    #[error("FATV table is empty: {0}")]
    EmptyFatvTable(String),

    #[error("Flow data not found: {0}")]
    MissingFlows(String),

    #[error("Unknown FATV id {0}")]
    UnknownFatv(FatvId),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid CSV in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, BalanceError>;
