//! Output formatting and persistence for derived tables.
//!
//! Files are written to a sibling temp file and renamed into place, so a
//! reader or a concurrent writer for the same day never sees a torn file.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use csv::WriterBuilder;

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: std::fmt::Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Prints a value as pretty JSON on stdout.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes a value as JSON to `path`, replacing any previous file.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    replace_file(path, &body)?;
    info!(path = %path.display(), bytes = body.len(), "Wrote JSON");
    Ok(())
}

/// Writes rows as a headered CSV to `path`, replacing any previous file.
pub fn write_records<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    let mut count = 0usize;
    for row in rows {
        writer.serialize(row)?;
        count += 1;
    }
    let body = writer.into_inner().context("Failed to flush CSV buffer")?;
    replace_file(path, &body)?;
    info!(path = %path.display(), rows = count, "Wrote CSV");
    Ok(())
}

fn replace_file(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        fatv: usize,
        err: f64,
    }

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&Row { fatv: 0, err: 0.0 });
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&Row { fatv: 0, err: 0.5 }).unwrap();
    }

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = temp_path("flow_balance_test_json");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("reports").join("date=2017-01-02.json");

        write_json(&path, &Row { fatv: 3, err: 0.25 }).unwrap();

        let back: Row = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, Row { fatv: 3, err: 0.25 });

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_records_replaces_file() {
        let path = temp_path("flow_balance_test_records.csv");
        let _ = fs::remove_file(&path);

        write_records(&path, [Row { fatv: 0, err: 0.1 }, Row { fatv: 1, err: 0.2 }]).unwrap();
        write_records(&path, [Row { fatv: 5, err: f64::NAN }]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        // Header written once, first run's rows replaced.
        assert_eq!(lines, vec!["fatv,err", "5,NaN"]);

        fs::remove_file(&path).unwrap();
    }
}
