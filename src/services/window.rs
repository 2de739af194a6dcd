use crate::error::PipelineError;
use crate::models::DiagnosisMeasurement;
use chrono::{DateTime, Duration, Utc};

/// Fixed sampling rate of both sensor streams.
pub const DATA_COUNT_PER_SECOND: i64 = 1;

/// Minimum share of expected samples a series must carry before the
/// measurement is worth assessing.
pub const MINIMUM_CTG_RATIO: f64 = 0.9;

/// The absolute time window to request data for, derived from a reference
/// instant and the configured duration/cutoff/interval. The fetch window is
/// padded with `cutoff` seconds on each side to give the assessment program
/// context; that padding is trimmed off the results later.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementWindow {
    reference: DateTime<Utc>,
    duration_seconds: i64,
    cutoff_seconds: i64,
    interval_seconds: i64,
}

impl MeasurementWindow {
    pub fn new(
        reference: DateTime<Utc>,
        duration_seconds: i64,
        cutoff_seconds: i64,
        interval_seconds: i64,
    ) -> Result<Self, PipelineError> {
        if duration_seconds <= 0 {
            return Err(PipelineError::Configuration(format!(
                "assessment duration must be positive: {duration_seconds}"
            )));
        }
        if cutoff_seconds < 0 || interval_seconds < 0 {
            return Err(PipelineError::Configuration(format!(
                "cutoff and interval must not be negative: cutoff = {cutoff_seconds}, interval = {interval_seconds}"
            )));
        }
        Ok(Self {
            reference,
            duration_seconds,
            cutoff_seconds,
            interval_seconds,
        })
    }

    /// The diagnosis reference instant; also the end of the fetch window.
    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_seconds)
    }

    pub fn cutoff(&self) -> Duration {
        Duration::seconds(self.cutoff_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds)
    }

    /// Seconds of data to fetch: the assessed duration plus one cutoff margin
    /// on each side.
    pub fn data_seconds(&self) -> i64 {
        self.duration_seconds + 2 * self.cutoff_seconds
    }

    pub fn data_duration(&self) -> Duration {
        Duration::seconds(self.data_seconds())
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.reference - self.data_duration()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Sample-count threshold below (or at) which a series disqualifies its
    /// measurement. Truncating conversion is deliberate.
    pub fn eligibility_threshold(&self) -> usize {
        ((DATA_COUNT_PER_SECOND * self.data_seconds()) as f64 * MINIMUM_CTG_RATIO) as usize
    }
}

/// Whether a fetched measurement has enough coverage in both series to be
/// dispatched. A series with exactly the threshold count is rejected.
/// Rejection is not an error; the measurement is logged and skipped.
pub fn is_eligible(window: &MeasurementWindow, measurement: &DiagnosisMeasurement) -> bool {
    let threshold = window.eligibility_threshold();
    let hr_count = measurement.heart_rates.len();
    let uc_count = measurement.tocos.len();
    if hr_count <= threshold || uc_count <= threshold {
        tracing::info!(
            measurement_id = measurement.measurement.id,
            hr_count,
            uc_count,
            threshold,
            "too few data; skipping measurement"
        );
        return false;
    }
    true
}
