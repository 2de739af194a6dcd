use crate::models::{Diagnosis, DiagnosisMeasurement, Measurement, SensorSample};
use crate::services::window::MeasurementWindow;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub const SENSOR_KIND_HEART_RATE: &str = "hr";
pub const SENSOR_KIND_TOCO: &str = "uc";

#[derive(sqlx::FromRow)]
struct MeasurementRow {
    id: i64,
    code: String,
    first_time: DateTime<Utc>,
    last_time: DateTime<Utc>,
    diagnosis_id: Option<i64>,
    diagnosis_baseline_bpm: Option<i32>,
    diagnosis_maximum_risk: Option<i32>,
    diagnosis_memo: Option<String>,
    diagnosis_range_from: Option<DateTime<Utc>>,
    diagnosis_range_until: Option<DateTime<Utc>>,
    diagnosis_created_at: Option<DateTime<Utc>>,
    diagnosis_modified_at: Option<DateTime<Utc>>,
}

impl MeasurementRow {
    fn into_entity(self) -> DiagnosisMeasurement {
        let latest_diagnosis = match (
            self.diagnosis_id,
            self.diagnosis_range_from,
            self.diagnosis_range_until,
        ) {
            (Some(id), Some(range_from), Some(range_until)) => Some(Diagnosis {
                id,
                measurement_id: self.id,
                baseline_bpm: self.diagnosis_baseline_bpm,
                maximum_risk: self.diagnosis_maximum_risk,
                memo: self.diagnosis_memo.unwrap_or_default(),
                range_from,
                range_until,
                created_at: self.diagnosis_created_at.unwrap_or(range_from),
                modified_at: self.diagnosis_modified_at.unwrap_or(range_until),
            }),
            _ => None,
        };
        DiagnosisMeasurement {
            measurement: Measurement {
                id: self.id,
                code: self.code,
                first_time: self.first_time,
                last_time: self.last_time,
            },
            latest_diagnosis,
            heart_rates: Vec::new(),
            tocos: Vec::new(),
        }
    }
}

/// Fetches the measurements to diagnose for a window, each joined with its
/// latest diagnosis: recordings that span the window start, lasted at least
/// the full data duration, and whose previous diagnosis (if any) ended by
/// `reference - interval` and before the recording's end. Both sensor series
/// are then loaded for the fetch window.
pub async fn collect_for_assessment(
    pool: &PgPool,
    window: &MeasurementWindow,
) -> Result<Vec<DiagnosisMeasurement>, sqlx::Error> {
    let rows: Vec<MeasurementRow> = sqlx::query_as(
        r#"
        SELECT
          m.id, m.code, m.first_time, m.last_time,
          d.id AS diagnosis_id,
          d.baseline_bpm AS diagnosis_baseline_bpm,
          d.maximum_risk AS diagnosis_maximum_risk,
          d.memo AS diagnosis_memo,
          d.range_from AS diagnosis_range_from,
          d.range_until AS diagnosis_range_until,
          d.created_at AS diagnosis_created_at,
          d.modified_at AS diagnosis_modified_at
        FROM measurement AS m
        LEFT JOIN (
          SELECT r.id, r.measurement_id
          FROM (
            SELECT
              d_.id, d_.measurement_id,
              RANK() OVER (
                PARTITION BY d_.measurement_id
                ORDER BY d_.range_until DESC, d_.id DESC
              ) AS rank
            FROM diagnosis AS d_
            INNER JOIN measurement AS m_ ON d_.measurement_id = m_.id
            WHERE m_.last_time >= $1
          ) AS r
          WHERE r.rank = 1
        ) AS ld ON m.id = ld.measurement_id
        LEFT JOIN diagnosis AS d ON ld.id = d.id
        WHERE m.last_time IS NOT NULL AND m.first_time IS NOT NULL
          AND m.last_time >= $1
          AND m.first_time <= $1
          AND m.last_time - m.first_time >= interval '1 second' * $2
          AND COALESCE(d.range_until <= $3, true)
          AND COALESCE(d.range_until < m.last_time, true)
        ORDER BY m.id ASC
        "#,
    )
    .bind(window.begin())
    .bind(window.data_seconds() as f64)
    .bind(window.reference() - window.interval())
    .fetch_all(pool)
    .await?;

    let mut measurements = Vec::with_capacity(rows.len());
    for row in rows {
        let mut measurement = row.into_entity();
        measurement.heart_rates = list_series(
            pool,
            measurement.measurement.id,
            SENSOR_KIND_HEART_RATE,
            window.begin(),
            window.end(),
        )
        .await?;
        measurement.tocos = list_series(
            pool,
            measurement.measurement.id,
            SENSOR_KIND_TOCO,
            window.begin(),
            window.end(),
        )
        .await?;
        measurements.push(measurement);
    }

    Ok(measurements)
}

/// Loads one sensor series time-ascending over `[begin, end)`.
async fn list_series(
    pool: &PgPool,
    measurement_id: i64,
    kind: &str,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SensorSample>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT value, observed_at
        FROM sensor_sample
        WHERE measurement_id = $1
          AND kind = $2
          AND observed_at >= $3
          AND observed_at < $4
        ORDER BY observed_at ASC
        "#,
    )
    .bind(measurement_id)
    .bind(kind)
    .bind(begin)
    .bind(end)
    .fetch_all(pool)
    .await
}
