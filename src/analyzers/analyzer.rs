use anyhow::{Context, Result};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

use crate::analyzers::aggregate::DayFlows;
use crate::analyzers::diagnose::ImbalanceDiagnoser;
use crate::analyzers::types::{DiagnosisReport, FatvFlowSeries};
use crate::config::BalanceConfig;
use crate::error::BalanceError;
use crate::fatv::{self, FatvId, FatvTable, Membership};
use crate::output::{write_json, write_records};
use crate::parser::{FlowSample, parse_fatv_table, parse_flows, parse_topology, parse_tracked};
use crate::topology::{DetectorId, TopologyGraph};

pub const FATV_FILE: &str = "fatvs.json";
pub const TRACKED_FILE: &str = "tracked.json";

/// The flow-conservation model of one topology version, loaded once and
/// shared read-only by every daily run.
#[derive(Debug, Clone)]
pub struct Model {
    pub table: FatvTable,
    pub membership: Membership,
    pub tracked: BTreeSet<DetectorId>,
}

impl Model {
    pub fn new(table: FatvTable, tracked: impl IntoIterator<Item = DetectorId>) -> Self {
        let membership = table.membership();
        Self {
            table,
            membership,
            tracked: tracked.into_iter().collect(),
        }
    }

    /// Loads `fatvs.json` and `tracked.json` from `model_dir`.
    ///
    /// # Errors
    ///
    /// Fails when the FATV table is missing, unreadable or empty. A missing
    /// tracked list falls back to the detectors named in the table.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let fatv_path = model_dir.join(FATV_FILE);
        let bytes = read_required(&fatv_path, BalanceError::MissingFatvTable)?;
        let table = parse_fatv_table(&bytes).map_err(|source| BalanceError::Json {
            path: fatv_path.display().to_string(),
            source,
        })?;
        if table.is_empty() {
            return Err(BalanceError::EmptyFatvTable(fatv_path.display().to_string()).into());
        }

        let tracked_path = model_dir.join(TRACKED_FILE);
        let tracked = match fs::read(&tracked_path) {
            Ok(bytes) => parse_tracked(&bytes).map_err(|source| BalanceError::Json {
                path: tracked_path.display().to_string(),
                source,
            })?,
            Err(e) => {
                warn!(path = %tracked_path.display(), error = %e, "Tracked list unavailable, using FATV detectors");
                table.iter().flat_map(|(_, f)| f.detectors()).collect()
            }
        };

        info!(fatvs = table.len(), tracked = tracked.len(), "Model loaded");
        Ok(Self::new(table, tracked))
    }
}

fn read_required(path: &Path, missing: fn(String) -> BalanceError) -> Result<Vec<u8>, BalanceError> {
    fs::read(path).map_err(|source| {
        let path = path.display().to_string();
        if source.kind() == std::io::ErrorKind::NotFound {
            missing(path)
        } else {
            BalanceError::Io { path, source }
        }
    })
}

/// Builds the topology graph, extracts its FATVs and writes `fatvs.json` and
/// `tracked.json` into `model_dir`.
#[tracing::instrument(skip(config), fields(topology = %topology_path.display(), model_dir = %model_dir.display()))]
pub fn extract_model(topology_path: &Path, model_dir: &Path, config: &BalanceConfig) -> Result<Model> {
    let bytes = read_required(topology_path, BalanceError::MissingTopology)?;
    let input = parse_topology(&bytes).map_err(|source| BalanceError::Json {
        path: topology_path.display().to_string(),
        source,
    })?;

    let topology = TopologyGraph::build(&input, &config.detectors);
    let table = fatv::extract(&topology);
    let tracked = topology.tracked_detectors();

    write_json(&model_dir.join(FATV_FILE), &table)?;
    write_json(&model_dir.join(TRACKED_FILE), &tracked)?;

    Ok(Model::new(table, tracked))
}

/// Location of the day's flow table: `date=YYYY-MM-DD.csv`, optionally gzipped.
pub fn flows_path(data_dir: &Path, date: NaiveDate) -> Option<PathBuf> {
    let stem = format!("date={}", date.format("%Y-%m-%d"));
    [format!("{stem}.csv"), format!("{stem}.csv.gz")]
        .into_iter()
        .map(|name| data_dir.join(name))
        .find(|path| path.exists())
}

pub fn report_path(output_dir: &Path, date: NaiveDate) -> PathBuf {
    output_dir
        .join("reports")
        .join(format!("date={}.json", date.format("%Y-%m-%d")))
}

pub fn metrics_path(output_dir: &Path, date: NaiveDate) -> PathBuf {
    output_dir
        .join("metrics")
        .join(format!("date={}.csv", date.format("%Y-%m-%d")))
}

/// Reads every sample of one day.
pub fn load_day_samples(data_dir: &Path, date: NaiveDate) -> Result<Vec<FlowSample>> {
    let Some(path) = flows_path(data_dir, date) else {
        return Err(BalanceError::MissingFlows(format!("{} for {}", data_dir.display(), date)).into());
    };

    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let samples = parse_flows(reader).map_err(|source| BalanceError::Csv {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), rows = samples.len(), "Loaded day flows");
    Ok(samples)
}

/// Diagnoses one day and writes its report and per-FATV metrics.
///
/// A day that already has a report is left untouched unless `force` is set;
/// the stored report is returned instead.
#[tracing::instrument(skip(model, config), fields(date = %date))]
pub fn analyze_for_date(
    model: &Model,
    config: &BalanceConfig,
    data_dir: &Path,
    output_dir: &Path,
    date: NaiveDate,
    force: bool,
) -> Result<DiagnosisReport> {
    let report_file = report_path(output_dir, date);
    if !force && report_file.exists() {
        info!(path = %report_file.display(), "Day already diagnosed, skipping");
        let stored = fs::read(&report_file)?;
        return Ok(serde_json::from_slice(&stored)?);
    }

    let samples = load_day_samples(data_dir, date)?;
    let flows = DayFlows::from_samples(
        &samples,
        config.thresholds.min_observed_pct,
        config.masked_detectors,
    );

    let diagnoser = ImbalanceDiagnoser::new(&model.table, &model.membership, &config.thresholds);
    let diagnosis = diagnoser.diagnose(date, &flows, &model.tracked);

    write_records(&metrics_path(output_dir, date), diagnosis.metrics.values())?;
    write_json(&report_file, &diagnosis.report)?;

    Ok(diagnosis.report)
}

/// Diagnoses several days concurrently, at most `concurrency` at a time.
/// Repeated dates run once. Results are returned in date order.
pub async fn analyze_dates(
    model: Arc<Model>,
    config: Arc<BalanceConfig>,
    data_dir: PathBuf,
    output_dir: PathBuf,
    dates: Vec<NaiveDate>,
    concurrency: usize,
    force: bool,
) -> Vec<(NaiveDate, Result<DiagnosisReport>)> {
    let dates: BTreeSet<NaiveDate> = dates.into_iter().collect();
    let concurrency = clamp_concurrency(concurrency);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));

    info!(days = dates.len(), concurrency, "Starting diagnosis");

    let mut tasks = Vec::new();
    for date in dates {
        let sem = semaphore.clone();
        let model = model.clone();
        let config = config.clone();
        let data_dir = data_dir.clone();
        let output_dir = output_dir.clone();

        let day_span = tracing::info_span!("diagnose_day", date = %date);
        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await?;
                tokio::task::spawn_blocking(move || {
                    analyze_for_date(&model, &config, &data_dir, &output_dir, date, force)
                })
                .await?
            }
            .instrument(day_span),
        );
        tasks.push((date, task));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (date, task) in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &outcome {
            error!(date = %date, error = %e, "Diagnosis failed");
        }
        results.push((date, outcome));
    }
    results
}

fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, tokio::sync::Semaphore::MAX_PERMITS)
}

/// Per-timestamp IN/OUT flows of one FATV on one day.
pub fn fatv_flows(model: &Model, config: &BalanceConfig, data_dir: &Path, id: FatvId, date: NaiveDate) -> Result<FatvFlowSeries> {
    let fatv = model.table.get(id).ok_or(BalanceError::UnknownFatv(id))?;
    let samples = load_day_samples(data_dir, date)?;
    let flows = DayFlows::from_samples(
        &samples,
        config.thresholds.min_observed_pct,
        config.masked_detectors,
    );
    Ok(flows.series(id, fatv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatv::Fatv;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 1, 2).unwrap()
    }

    const DAY_CSV: &str = "\
Timestamp,Station,Flow,Occupancy,Observed
01/02/2017 00:00:00,716001,100,0.05,100
01/02/2017 00:00:00,716002,100,0.05,100
01/02/2017 00:05:00,716001,80,0.05,100
01/02/2017 00:05:00,716002,80,0.05,100
";

    fn model() -> Model {
        Model::new(
            FatvTable::from_fatvs([Fatv {
                inbound: vec![716001],
                outbound: vec![716002],
            }]),
            [716001, 716002],
        )
    }

    #[test]
    fn test_load_missing_model_is_fatal() {
        let dir = temp_dir("flow_balance_test_missing_model");
        let err = Model::load(&dir).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BalanceError>(),
            Some(BalanceError::MissingFatvTable(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_empty_model_is_fatal() {
        let dir = temp_dir("flow_balance_test_empty_model");
        fs::write(dir.join(FATV_FILE), "{}").unwrap();
        let err = Model::load(&dir).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BalanceError>(),
            Some(BalanceError::EmptyFatvTable(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_without_tracked_uses_table() {
        let dir = temp_dir("flow_balance_test_untracked_model");
        fs::write(dir.join(FATV_FILE), r#"{"0": {"IN": [5], "OUT": [6]}}"#).unwrap();
        let model = Model::load(&dir).unwrap();
        assert_eq!(model.tracked.iter().copied().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(model.membership.fatv_in(5), Some(0));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_analyze_for_date_writes_outputs() {
        let dir = temp_dir("flow_balance_test_analyze");
        fs::write(dir.join("date=2017-01-02.csv"), DAY_CSV).unwrap();

        let report = analyze_for_date(&model(), &BalanceConfig::default(), &dir, &dir, date(), false).unwrap();
        assert!(report.error.is_empty());
        assert_eq!(report.date, date());

        assert!(report_path(&dir, date()).exists());
        let metrics = fs::read_to_string(metrics_path(&dir, date())).unwrap();
        assert!(metrics.starts_with("fatv,in_total,out_total,dif,vol,err,status"));
        assert!(metrics.contains("0,180.0,180.0,0.0,360.0,0.0,balanced"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_existing_report_is_not_rewritten() {
        let dir = temp_dir("flow_balance_test_skip");
        fs::write(dir.join("date=2017-01-02.csv"), DAY_CSV).unwrap();

        let first = analyze_for_date(&model(), &BalanceConfig::default(), &dir, &dir, date(), false).unwrap();
        // Input disappears; the stored report still answers.
        fs::remove_file(dir.join("date=2017-01-02.csv")).unwrap();
        let second = analyze_for_date(&model(), &BalanceConfig::default(), &dir, &dir, date(), false).unwrap();
        assert_eq!(first, second);

        let forced = analyze_for_date(&model(), &BalanceConfig::default(), &dir, &dir, date(), true);
        assert!(forced.is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_gzipped_flows_are_read() {
        let dir = temp_dir("flow_balance_test_gzip");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DAY_CSV.as_bytes()).unwrap();
        fs::write(dir.join("date=2017-01-02.csv.gz"), encoder.finish().unwrap()).unwrap();

        let samples = load_day_samples(&dir, date()).unwrap();
        assert_eq!(samples.len(), 4);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_fatv_flows_unknown_id() {
        let dir = temp_dir("flow_balance_test_series");
        fs::write(dir.join("date=2017-01-02.csv"), DAY_CSV).unwrap();

        let series = fatv_flows(&model(), &BalanceConfig::default(), &dir, 0, date()).unwrap();
        assert_eq!(series.inbound.y, vec![Some(100.0), Some(80.0)]);

        let err = fatv_flows(&model(), &BalanceConfig::default(), &dir, 9, date()).unwrap_err();
        assert!(matches!(err.downcast_ref::<BalanceError>(), Some(BalanceError::UnknownFatv(9))));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(4), 4);
        assert_eq!(clamp_concurrency(usize::MAX), tokio::sync::Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_analyze_dates_with_oversized_concurrency() {
        let dir = temp_dir("flow_balance_test_oversized_concurrency");
        fs::write(dir.join("date=2017-01-02.csv"), DAY_CSV).unwrap();

        let results = analyze_dates(
            Arc::new(model()),
            Arc::new(BalanceConfig::default()),
            dir.clone(),
            dir.clone(),
            vec![date()],
            usize::MAX,
            false,
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_analyze_dates_collapses_duplicates() {
        let dir = temp_dir("flow_balance_test_dates");
        fs::write(dir.join("date=2017-01-02.csv"), DAY_CSV).unwrap();
        let missing = NaiveDate::from_ymd_opt(2017, 1, 3).unwrap();

        let results = analyze_dates(
            Arc::new(model()),
            Arc::new(BalanceConfig::default()),
            dir.clone(),
            dir.clone(),
            vec![missing, date(), date()],
            2,
            false,
        )
        .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, date());
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());

        fs::remove_dir_all(&dir).unwrap();
    }
}
