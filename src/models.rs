use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One monitored CTG session, bounded by its first and last recorded sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub code: String,
    pub first_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
}

/// A single sensor reading from either stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorSample {
    pub value: i32,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiagnosisAlgorithm {
    pub id: i64,
    pub name: String,
    pub version: String,
}

/// Aggregated risk assessment for one measurement over a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: i64,
    pub measurement_id: i64,
    pub baseline_bpm: Option<i32>,
    pub maximum_risk: Option<i32>,
    pub memo: String,
    pub range_from: DateTime<Utc>,
    pub range_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A sub-interval of a diagnosis. `parameters` is the opaque key-value
/// payload emitted by the assessment program; it is stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisContent {
    pub risk: Option<i32>,
    pub range_from: DateTime<Utc>,
    pub range_until: DateTime<Utc>,
    pub parameters: JsonValue,
}

/// A diagnosis together with the algorithm that produced it and its ordered
/// content entries. Built by one assessment task, narrowed by the boundary
/// trimmer, then handed to the persister unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisEntity {
    pub diagnosis: Diagnosis,
    pub algorithm_id: i64,
    pub contents: Vec<DiagnosisContent>,
}

/// A measurement selected for assessment, carrying both sensor series for the
/// fetch window and the latest prior diagnosis when one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisMeasurement {
    pub measurement: Measurement,
    pub latest_diagnosis: Option<Diagnosis>,
    pub heart_rates: Vec<SensorSample>,
    pub tocos: Vec<SensorSample>,
}
