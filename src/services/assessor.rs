use crate::config::AssessorConfig;
use crate::error::AssessmentError;
use crate::models::{
    Diagnosis, DiagnosisContent, DiagnosisEntity, DiagnosisMeasurement, SensorSample,
};
use crate::store;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::PgPool;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// The external risk-assessment procedure, invoked once per eligible
/// measurement. The pipeline only sees this seam; stub implementations drive
/// the dispatcher tests.
pub trait Assessor: Send + Sync + 'static {
    fn assess(
        &self,
        measurement: &DiagnosisMeasurement,
        diagnosis_time: DateTime<Utc>,
        duration: Duration,
    ) -> impl Future<Output = Result<DiagnosisEntity, AssessmentError>> + Send;
}

/// Drives the assessment program as a child process: writes both sensor
/// series as CSV input files, runs the command and parses its stdout into a
/// diagnosis.
#[derive(Debug, Clone)]
pub struct ProcessAssessor {
    pool: PgPool,
    root: PathBuf,
    command: String,
    parameters: String,
    algorithm: String,
    version: String,
}

impl ProcessAssessor {
    pub fn new(pool: PgPool, config: &AssessorConfig) -> Self {
        Self {
            pool,
            root: config.root.clone(),
            command: config.command.clone(),
            parameters: config.parameters.clone(),
            algorithm: config.algorithm.clone(),
            version: config.version.clone(),
        }
    }

    /// Input files are grouped per day under `root/input/YYYY/MM/DD`.
    fn input_dir_for_today(&self) -> PathBuf {
        let today = Utc::now();
        self.root
            .join("input")
            .join(format!("{:04}", today.year()))
            .join(format!("{:02}", today.month()))
            .join(format!("{:02}", today.day()))
    }
}

impl Assessor for ProcessAssessor {
    fn assess(
        &self,
        measurement: &DiagnosisMeasurement,
        diagnosis_time: DateTime<Utc>,
        duration: Duration,
    ) -> impl Future<Output = Result<DiagnosisEntity, AssessmentError>> + Send {
        async move {
            let algorithm = store::diagnoses::fetch_algorithm_by_name(
                &self.pool,
                &self.algorithm,
                &self.version,
            )
            .await?
            .ok_or_else(|| AssessmentError::UnknownAlgorithm {
                name: self.algorithm.clone(),
                version: self.version.clone(),
            })?;

            let input_dir = self.input_dir_for_today();
            tokio::fs::create_dir_all(&input_dir).await?;

            let measurement_id = measurement.measurement.id;
            let stamp = diagnosis_time.format("%Y%m%d-%H%M%S");
            let hr_path = input_dir.join(format!("{stamp}-{measurement_id}-HR.csv"));
            let uc_path = input_dir.join(format!("{stamp}-{measurement_id}-UC.csv"));
            write_series(&hr_path, "F1", &measurement.heart_rates)?;
            write_series(&uc_path, "UC", &measurement.tocos)?;

            // The previous baseline bpm seeds the program; the literal string
            // "null" means no prior diagnosis exists.
            let bpm_arg = measurement
                .latest_diagnosis
                .as_ref()
                .and_then(|diagnosis| diagnosis.baseline_bpm)
                .map(|bpm| bpm.to_string())
                .unwrap_or_else(|| "null".to_string());

            let output = Command::new(self.root.join(&self.command))
                .arg(&hr_path)
                .arg(&uc_path)
                .arg(self.root.join(&self.parameters))
                .arg(&bpm_arg)
                .output()
                .await?;
            if !output.status.success() {
                return Err(AssessmentError::Command(format!(
                    "{} exited with {}",
                    self.command, output.status
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let items = parse_output(&stdout);
            build_entity(measurement_id, algorithm.id, diagnosis_time, duration, items)
        }
    }
}

fn write_series(path: &Path, field: &str, samples: &[SensorSample]) -> Result<(), AssessmentError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["RecordTime", field])?;
    for sample in samples {
        writer.write_record([
            sample.observed_at.timestamp_millis().to_string(),
            sample.value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// One parsed output block: consecutive lines sharing a time range merge into
/// a single parameter map.
#[derive(Debug)]
struct DiagnosisItem {
    range_from: i64,
    range_until: i64,
    parameters: JsonMap<String, JsonValue>,
}

/// Parses the program's stdout. The first line is a header; `Data End`
/// terminates the payload. Each data line reads
/// `<from_ms> - <until_ms> <key> [<value>]`; malformed lines are logged and
/// skipped rather than failing the assessment.
fn parse_output(stdout: &str) -> Vec<DiagnosisItem> {
    let mut items: Vec<DiagnosisItem> = Vec::new();

    let mut lines = stdout.lines();
    lines.next();

    for line in lines {
        if line == "Data End" {
            break;
        }

        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() < 4 || tokens[1] != "-" {
            tracing::warn!(line, "unexpected assessment output line");
            continue;
        }

        let (Ok(range_from), Ok(range_until)) =
            (tokens[0].parse::<i64>(), tokens[2].parse::<i64>())
        else {
            tracing::warn!(line, "unexpected assessment output line");
            continue;
        };

        let continues_current = items
            .last()
            .is_some_and(|item| item.range_from == range_from && item.range_until == range_until);
        if !continues_current {
            items.push(DiagnosisItem {
                range_from,
                range_until,
                parameters: JsonMap::new(),
            });
        }

        let value = tokens
            .get(4)
            .map_or(JsonValue::Null, |raw| parse_parameter(raw));
        if let Some(item) = items.last_mut() {
            item.parameters.insert(tokens[3].to_string(), value);
        }
    }

    items
}

/// Parameter values are typed opportunistically: integer first, then float,
/// otherwise kept as a string.
fn parse_parameter(raw: &str) -> JsonValue {
    if let Ok(value) = raw.parse::<i64>() {
        return JsonValue::from(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(value) {
            return JsonValue::Number(number);
        }
    }
    JsonValue::from(raw)
}

fn build_entity(
    measurement_id: i64,
    algorithm_id: i64,
    diagnosis_time: DateTime<Utc>,
    duration: Duration,
    items: Vec<DiagnosisItem>,
) -> Result<DiagnosisEntity, AssessmentError> {
    let now = Utc::now();

    let mut baseline_bpm: Option<i32> = None;
    let mut maximum_risk: Option<i32> = None;
    let mut contents = Vec::with_capacity(items.len());

    for item in items {
        let range_from = timestamp_from_millis(item.range_from)?;
        let range_until = timestamp_from_millis(item.range_until)?;

        if let Some(value) = item.parameters.get("Baseline-NORMAL").and_then(JsonValue::as_i64) {
            baseline_bpm = Some(value as i32);
        }

        let mut risk = None;
        if let Some(value) = item.parameters.get("Risk").and_then(JsonValue::as_i64) {
            let value = value as i32;
            risk = Some(value);
            if maximum_risk.is_none_or(|current| value > current) {
                maximum_risk = Some(value);
            }
        }

        contents.push(DiagnosisContent {
            risk,
            range_from,
            range_until,
            parameters: JsonValue::Object(item.parameters),
        });
    }

    Ok(DiagnosisEntity {
        diagnosis: Diagnosis {
            id: 0,
            measurement_id,
            baseline_bpm,
            maximum_risk,
            memo: String::new(),
            range_from: diagnosis_time - duration,
            range_until: diagnosis_time,
            created_at: now,
            modified_at: now,
        },
        algorithm_id,
        contents,
    })
}

fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>, AssessmentError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AssessmentError::Output(format!("timestamp out of range: {millis}")))
}
