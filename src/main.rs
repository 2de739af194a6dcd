use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use ctg_assessor_rs::config::AssessorConfig;
use ctg_assessor_rs::db;
use ctg_assessor_rs::error::PipelineError;
use ctg_assessor_rs::services::assessor::ProcessAssessor;
use ctg_assessor_rs::services::pipeline;
use ctg_assessor_rs::services::window::MeasurementWindow;
use ctg_assessor_rs::store;
use std::sync::Arc;
use std::time::Duration as StdDuration;

#[derive(Parser, Debug)]
#[command(
    about = "Scheduled batch: run the CTG risk assessment over eligible measurements and record the diagnoses."
)]
struct Args {
    /// Override the diagnosis reference time (UTC, YYYYMMDDhhmmss).
    /// Defaults to now minus the configured delay.
    #[arg(long)]
    now: Option<String>,
}

fn parse_compact_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .with_context(|| format!("invalid reference time (expected YYYYMMDDhhmmss): {raw}"))?;
    Ok(parsed.and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AssessorConfig::from_env()?;
    let pool = db::connect(&config.database_url).await?;

    let diagnosis_time = match args.now.as_deref() {
        Some(raw) => parse_compact_timestamp(raw)?,
        None => Utc::now() - chrono::Duration::seconds(config.delay_seconds),
    };
    tracing::info!(diagnosis_time = %diagnosis_time, "starting diagnosis run");

    let window = MeasurementWindow::new(
        diagnosis_time,
        config.duration_seconds,
        config.cutoff_seconds,
        config.interval_seconds,
    )?;

    let measurements = store::measurements::collect_for_assessment(&pool, &window)
        .await
        .map_err(PipelineError::Fetch)?;
    if measurements.is_empty() {
        tracing::info!("no measurements are found");
        return Ok(());
    }
    tracing::info!(count = measurements.len(), "collected measurements");

    let assessor = Arc::new(ProcessAssessor::new(pool.clone(), &config));
    let timeout =
        (config.timeout_seconds > 0).then(|| StdDuration::from_secs(config.timeout_seconds));
    let batch = pipeline::run_batch(assessor, window, measurements, timeout).await;

    if batch.dispatched == 0 {
        tracing::info!("no measurements are used for diagnosis");
        return Ok(());
    }
    tracing::info!(
        succeeded = batch.diagnoses.len(),
        failed = batch.failures.len(),
        "assessments finished"
    );

    let sink = pipeline::PgDiagnosisSink::new(pool);
    pipeline::persist_batch(&sink, &batch.diagnoses).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_compact_timestamp;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_compact_utc_timestamps() {
        let parsed = parse_compact_timestamp("20210102030405").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn rejects_malformed_timestamps() {
        assert!(parse_compact_timestamp("2021-01-02").is_err());
        assert!(parse_compact_timestamp("20211302030405").is_err());
    }
}
