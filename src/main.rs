//! CLI entry point for the flow-balance diagnosis tool.
//!
//! Provides subcommands for extracting FATVs from a network topology,
//! diagnosing daily detector data, and inspecting single FATVs or detectors.

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use flow_balance::analyzers::analyzer::{Model, analyze_dates, extract_model, fatv_flows};
use flow_balance::config::BalanceConfig;
use flow_balance::output::{print_json, print_pretty};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "flow_balance")]
#[command(about = "Diagnose miscounting freeway detectors from flow conservation", long_about = None)]
struct Cli {
    /// TOML file with thresholds and detector policy
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract FATVs and tracked detectors from a topology JSON
    Extract {
        #[arg(value_name = "TOPOLOGY")]
        topology: PathBuf,

        /// Directory to write fatvs.json and tracked.json to
        #[arg(short, long, default_value = "model")]
        model_dir: PathBuf,
    },
    /// Diagnose one or more days of detector data (default: yesterday)
    Diagnose {
        #[arg(value_name = "DATE")]
        dates: Vec<NaiveDate>,

        #[arg(short, long, default_value = "model")]
        model_dir: PathBuf,

        /// Directory holding date=YYYY-MM-DD.csv[.gz] files
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Maximum number of days diagnosed at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Recompute days that already have a report
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print the per-timestamp IN/OUT flows of one FATV
    Flows {
        fatv: usize,

        date: NaiveDate,

        #[arg(short, long, default_value = "model")]
        model_dir: PathBuf,

        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// List the detectors sharing a FATV with a detector
    Neighborhood {
        detector: u64,

        #[arg(short, long, default_value = "model")]
        model_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/flow_balance.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("flow_balance.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = BalanceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Extract {
            topology,
            model_dir,
        } => {
            let model = extract_model(&topology, &model_dir, &config)?;
            info!(
                fatvs = model.table.len(),
                tracked = model.tracked.len(),
                model_dir = %model_dir.display(),
                "Model extracted"
            );
        }
        Commands::Diagnose {
            dates,
            model_dir,
            data_dir,
            output_dir,
            concurrency,
            force,
        } => {
            let dates = if dates.is_empty() {
                let yesterday = Utc::now()
                    .date_naive()
                    .pred_opt()
                    .context("No date before today")?;
                vec![yesterday]
            } else {
                dates
            };

            let model = Model::load(&model_dir)
                .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;
            let results = analyze_dates(
                Arc::new(model),
                Arc::new(config),
                data_dir,
                output_dir,
                dates,
                concurrency,
                force,
            )
            .await;

            let mut failed = 0;
            for (date, outcome) in &results {
                match outcome {
                    Ok(report) => info!(
                        date = %date,
                        error = report.error.len(),
                        unobv = report.unobv.len(),
                        unknown = report.unknown.len(),
                        untracked = report.untracked.len(),
                        singleton = report.singleton.len(),
                        imbalanced = report.imbalanced.len(),
                        "Day diagnosed"
                    ),
                    Err(e) => {
                        error!(date = %date, error = ?e, "Day failed");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} days failed", results.len());
            }
        }
        Commands::Flows {
            fatv,
            date,
            model_dir,
            data_dir,
        } => {
            let model = Model::load(&model_dir)?;
            let series = fatv_flows(&model, &config, &data_dir, fatv, date)?;
            print_pretty(&series);
            print_json(&series)?;
        }
        Commands::Neighborhood {
            detector,
            model_dir,
        } => {
            let model = Model::load(&model_dir)?;
            let neighbors = model.table.neighborhood(&model.membership, detector);
            if neighbors.is_empty() {
                info!(detector, "Detector is not part of any FATV");
            }
            print_json(&serde_json::json!({
                "detector": detector,
                "fatv_in": model.membership.inbound_of(detector),
                "fatv_out": model.membership.outbound_of(detector),
                "neighbors": neighbors,
            }))?;
        }
    }

    Ok(())
}
