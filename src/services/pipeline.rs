use crate::error::{AssessmentError, PipelineError};
use crate::models::{DiagnosisEntity, DiagnosisMeasurement};
use crate::services::assessor::Assessor;
use crate::services::window::{self, MeasurementWindow};
use crate::store;
use chrono::Duration;
use futures::FutureExt;
use sqlx::PgPool;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;

/// Exactly one outcome is produced per dispatched measurement.
#[derive(Debug)]
pub enum DiagnosisOutcome {
    Success(DiagnosisEntity),
    Failure {
        measurement_id: i64,
        error: AssessmentError,
    },
}

/// Aggregated result of one fan-out/fan-in round.
#[derive(Debug)]
pub struct BatchResult {
    pub diagnoses: Vec<DiagnosisEntity>,
    pub failures: Vec<(i64, AssessmentError)>,
    pub dispatched: usize,
}

/// Runs the assessment once per eligible measurement, concurrently, and
/// gathers every outcome. One task per measurement is spawned immediately;
/// outcomes arrive on a single unbounded channel in completion order and the
/// controller reads exactly as many as it dispatched. A failed measurement is
/// logged and counted without blocking the others. Each assessment call is
/// bounded by `timeout` so a hung external program surfaces as a `Timeout`
/// failure instead of stalling the whole run.
pub async fn run_batch<A: Assessor>(
    assessor: Arc<A>,
    window: MeasurementWindow,
    measurements: Vec<DiagnosisMeasurement>,
    timeout: Option<StdDuration>,
) -> BatchResult {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let mut dispatched = 0usize;
    for measurement in measurements {
        if !window::is_eligible(&window, &measurement) {
            continue;
        }
        dispatched += 1;

        let assessor = assessor.clone();
        let outcome_tx = outcome_tx.clone();
        let reference = window.reference();
        let duration = window.duration();
        let cutoff = window.cutoff();
        tokio::spawn(async move {
            let measurement_id = measurement.measurement.id;
            tracing::info!(
                measurement_id,
                code = %measurement.measurement.code,
                "starting assessment"
            );

            let result = match timeout {
                Some(limit) => {
                    match tokio::time::timeout(
                        limit,
                        assessor.assess(&measurement, reference, duration),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(AssessmentError::Timeout(limit)),
                    }
                }
                None => assessor.assess(&measurement, reference, duration).await,
            };

            let outcome = match result {
                Ok(mut entity) => {
                    trim_cutoff(&mut entity, cutoff);
                    DiagnosisOutcome::Success(entity)
                }
                Err(error) => DiagnosisOutcome::Failure {
                    measurement_id,
                    error,
                },
            };
            let _ = outcome_tx.send(outcome);
        });
    }
    drop(outcome_tx);

    let mut diagnoses = Vec::new();
    let mut failures = Vec::new();
    for _ in 0..dispatched {
        match outcome_rx.recv().await {
            Some(DiagnosisOutcome::Success(entity)) => {
                tracing::info!(
                    measurement_id = entity.diagnosis.measurement_id,
                    contents = entity.contents.len(),
                    "assessment succeeded"
                );
                diagnoses.push(entity);
            }
            Some(DiagnosisOutcome::Failure {
                measurement_id,
                error,
            }) => {
                tracing::warn!(measurement_id, error = %error, "assessment failed");
                failures.push((measurement_id, error));
            }
            // Every sender is gone: a worker died without reporting. The
            // remaining outcomes can never arrive, so stop instead of hanging.
            None => {
                tracing::error!("an assessment task exited without reporting an outcome");
                break;
            }
        }
    }

    BatchResult {
        diagnoses,
        failures,
        dispatched,
    }
}

/// Discards content entries generated inside the cutoff margins. The fetch
/// window is padded with `cutoff` seconds on each side purely to give the
/// assessment program context; content inside those margins is unreliable.
/// Entries are assumed ordered by `range_from`; the list is only narrowed
/// from both ends, never re-sorted or merged. The last entry ending at or
/// before the trimmed upper bound is retained.
pub fn trim_cutoff(entity: &mut DiagnosisEntity, cutoff: Duration) {
    if cutoff <= Duration::zero() || entity.contents.is_empty() {
        return;
    }

    let from = entity.diagnosis.range_from + cutoff;
    let until = entity.diagnosis.range_until - cutoff;

    let skipped_front = entity
        .contents
        .iter()
        .take_while(|content| content.range_from < from)
        .count();
    let skipped_back = entity
        .contents
        .iter()
        .rev()
        .take_while(|content| content.range_until > until)
        .count();

    // The margins overlap the entire content range.
    if skipped_front + skipped_back >= entity.contents.len() {
        entity.contents.clear();
        return;
    }

    let retained_until = entity.contents.len() - skipped_back;
    entity.contents.truncate(retained_until);
    entity.contents.drain(..skipped_front);
}

/// The durable store the persister writes through. Registration happens
/// inside one transaction owned by the caller; the caller alone decides
/// commit or rollback. A stub implementation drives the persister tests.
pub trait DiagnosisSink {
    type Transaction: Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, sqlx::Error>> + Send;
    fn register(
        &self,
        tx: &mut Self::Transaction,
        entities: &[DiagnosisEntity],
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

/// Postgres-backed sink; the thin default used by the binary.
pub struct PgDiagnosisSink {
    pool: PgPool,
}

impl PgDiagnosisSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DiagnosisSink for PgDiagnosisSink {
    type Transaction = sqlx::Transaction<'static, sqlx::Postgres>;

    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, sqlx::Error>> + Send {
        async move { self.pool.begin().await }
    }

    fn register(
        &self,
        tx: &mut Self::Transaction,
        entities: &[DiagnosisEntity],
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
        store::diagnoses::register_diagnoses(tx, entities)
    }

    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
        async move { tx.commit().await }
    }

    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
        async move { tx.rollback().await }
    }
}

/// Durably records every diagnosis of the run as one atomic unit. The
/// transaction commits only if the whole registration succeeded; an error or
/// a panic during the persistence phase rolls everything back, discarding the
/// run's diagnoses, and is reported as an error rather than a crash.
pub async fn persist_batch<S: DiagnosisSink>(
    sink: &S,
    entities: &[DiagnosisEntity],
) -> Result<(), PipelineError> {
    let mut tx = sink.begin().await.map_err(PipelineError::Persistence)?;

    let registration = AssertUnwindSafe(sink.register(&mut tx, entities))
        .catch_unwind()
        .await;

    match registration {
        Ok(Ok(())) => {
            sink.commit(tx).await.map_err(PipelineError::Persistence)?;
            tracing::info!(count = entities.len(), "registered diagnoses");
            Ok(())
        }
        Ok(Err(error)) => {
            if let Err(rollback_error) = sink.rollback(tx).await {
                tracing::error!(error = %rollback_error, "rollback failed");
            }
            tracing::error!(error = %error, "failed to register diagnoses");
            Err(PipelineError::Persistence(error))
        }
        Err(payload) => {
            if let Err(rollback_error) = sink.rollback(tx).await {
                tracing::error!(error = %rollback_error, "rollback failed");
            }
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "diagnosis registration panicked");
            Err(PipelineError::Fault(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Diagnosis, DiagnosisContent, Measurement, SensorSample};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap()
    }

    fn entity_with_contents(
        overall_seconds: (i64, i64),
        content_seconds: &[(i64, i64)],
    ) -> DiagnosisEntity {
        let base = reference();
        let at = |offset: i64| base + Duration::seconds(offset);
        DiagnosisEntity {
            diagnosis: Diagnosis {
                id: 0,
                measurement_id: 3,
                baseline_bpm: None,
                maximum_risk: None,
                memo: String::new(),
                range_from: at(overall_seconds.0),
                range_until: at(overall_seconds.1),
                created_at: base,
                modified_at: base,
            },
            algorithm_id: 1,
            contents: content_seconds
                .iter()
                .map(|&(from, until)| DiagnosisContent {
                    risk: None,
                    range_from: at(from),
                    range_until: at(until),
                    parameters: json!({}),
                })
                .collect(),
        }
    }

    fn content_ranges(entity: &DiagnosisEntity) -> Vec<(i64, i64)> {
        let base = reference();
        entity
            .contents
            .iter()
            .map(|content| {
                (
                    (content.range_from - base).num_seconds(),
                    (content.range_until - base).num_seconds(),
                )
            })
            .collect()
    }

    #[test]
    fn zero_cutoff_leaves_contents_untouched() {
        let mut entity = entity_with_contents((0, 90), &[(0, 30), (30, 60), (60, 90)]);
        trim_cutoff(&mut entity, Duration::zero());
        assert_eq!(content_ranges(&entity), vec![(0, 30), (30, 60), (60, 90)]);
    }

    #[test]
    fn trims_entries_inside_the_margins() {
        let mut entity = entity_with_contents((0, 90), &[(0, 30), (30, 60), (60, 90)]);
        trim_cutoff(&mut entity, Duration::seconds(20));
        // from = 20, until = 70: the first entry starts before 20 and the
        // last ends after 70; the middle entry survives.
        assert_eq!(content_ranges(&entity), vec![(30, 60)]);
    }

    #[test]
    fn clears_contents_when_margins_cover_everything() {
        let mut entity = entity_with_contents((0, 90), &[(0, 30), (30, 60), (60, 90)]);
        trim_cutoff(&mut entity, Duration::seconds(40));
        assert!(entity.contents.is_empty());
    }

    #[test]
    fn entry_touching_both_trimmed_bounds_is_retained() {
        let mut entity = entity_with_contents((0, 90), &[(20, 70)]);
        trim_cutoff(&mut entity, Duration::seconds(20));
        assert_eq!(content_ranges(&entity), vec![(20, 70)]);
    }

    #[test]
    fn single_entry_crossing_a_margin_is_dropped() {
        let mut entity = entity_with_contents((0, 90), &[(10, 80)]);
        trim_cutoff(&mut entity, Duration::seconds(20));
        assert!(entity.contents.is_empty());
    }

    #[derive(Clone)]
    struct StubAssessor {
        calls: Arc<AtomicUsize>,
        failing: Arc<HashSet<i64>>,
        delays_ms: Arc<HashMap<i64, u64>>,
    }

    impl StubAssessor {
        fn new(failing: &[i64], delays_ms: &[(i64, u64)]) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                failing: Arc::new(failing.iter().copied().collect()),
                delays_ms: Arc::new(delays_ms.iter().copied().collect()),
            }
        }
    }

    impl Assessor for StubAssessor {
        fn assess(
            &self,
            measurement: &DiagnosisMeasurement,
            diagnosis_time: DateTime<Utc>,
            duration: Duration,
        ) -> impl std::future::Future<Output = Result<DiagnosisEntity, AssessmentError>> + Send
        {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let id = measurement.measurement.id;
                if let Some(delay) = self.delays_ms.get(&id) {
                    tokio::time::sleep(StdDuration::from_millis(*delay)).await;
                }
                if self.failing.contains(&id) {
                    return Err(AssessmentError::Command("stub failure".to_string()));
                }
                Ok(DiagnosisEntity {
                    diagnosis: Diagnosis {
                        id: 0,
                        measurement_id: id,
                        baseline_bpm: None,
                        maximum_risk: None,
                        memo: String::new(),
                        range_from: diagnosis_time - duration,
                        range_until: diagnosis_time,
                        created_at: diagnosis_time,
                        modified_at: diagnosis_time,
                    },
                    algorithm_id: 1,
                    contents: Vec::new(),
                })
            }
        }
    }

    fn measurement_with_samples(id: i64, count: usize) -> DiagnosisMeasurement {
        let begin = reference() - Duration::seconds(count as i64);
        let series = (0..count)
            .map(|i| SensorSample {
                value: 100 + (i % 40) as i32,
                observed_at: begin + Duration::seconds(i as i64),
            })
            .collect::<Vec<_>>();
        DiagnosisMeasurement {
            measurement: Measurement {
                id,
                code: format!("m-{id:04}"),
                first_time: begin,
                last_time: reference(),
            },
            latest_diagnosis: None,
            heart_rates: series.clone(),
            tocos: series,
        }
    }

    // duration 10, cutoff 0: threshold = floor(10 * 0.9) = 9.
    fn test_window() -> MeasurementWindow {
        MeasurementWindow::new(reference(), 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn consumes_every_outcome_regardless_of_arrival_order() {
        let assessor = Arc::new(StubAssessor::new(&[3], &[(1, 40), (2, 1), (3, 20), (4, 5)]));
        let measurements = (1..=4).map(|id| measurement_with_samples(id, 20)).collect();

        let batch = run_batch(assessor.clone(), test_window(), measurements, None).await;

        assert_eq!(batch.dispatched, 4);
        assert_eq!(assessor.calls.load(Ordering::SeqCst), 4);

        let mut succeeded: Vec<i64> = batch
            .diagnoses
            .iter()
            .map(|entity| entity.diagnosis.measurement_id)
            .collect();
        succeeded.sort_unstable();
        assert_eq!(succeeded, vec![1, 2, 4]);

        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, 3);
    }

    #[tokio::test]
    async fn ineligible_measurements_are_never_dispatched() {
        let assessor = Arc::new(StubAssessor::new(&[], &[]));
        let measurements = vec![
            measurement_with_samples(1, 5),
            measurement_with_samples(2, 20),
        ];

        let batch = run_batch(assessor.clone(), test_window(), measurements, None).await;

        assert_eq!(batch.dispatched, 1);
        assert_eq!(assessor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(batch.diagnoses.len(), 1);
        assert_eq!(batch.diagnoses[0].diagnosis.measurement_id, 2);
    }

    #[tokio::test]
    async fn zero_eligible_measurements_yield_an_empty_batch() {
        let assessor = Arc::new(StubAssessor::new(&[], &[]));
        let measurements = vec![
            measurement_with_samples(1, 3),
            measurement_with_samples(2, 9),
        ];

        let batch = run_batch(assessor.clone(), test_window(), measurements, None).await;

        assert_eq!(batch.dispatched, 0);
        assert_eq!(assessor.calls.load(Ordering::SeqCst), 0);
        assert!(batch.diagnoses.is_empty());
        assert!(batch.failures.is_empty());
    }

    #[tokio::test]
    async fn slow_assessment_surfaces_a_timeout_failure() {
        let assessor = Arc::new(StubAssessor::new(&[], &[(1, 500)]));
        let measurements = vec![
            measurement_with_samples(1, 20),
            measurement_with_samples(2, 20),
        ];

        let batch = run_batch(
            assessor,
            test_window(),
            measurements,
            Some(StdDuration::from_millis(20)),
        )
        .await;

        assert_eq!(batch.dispatched, 2);
        assert_eq!(batch.diagnoses.len(), 1);
        assert_eq!(batch.diagnoses[0].diagnosis.measurement_id, 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, 1);
        assert!(matches!(batch.failures[0].1, AssessmentError::Timeout(_)));
    }

    #[tokio::test]
    async fn successful_entities_are_trimmed_before_reporting() {
        #[derive(Clone)]
        struct ContentAssessor;

        impl Assessor for ContentAssessor {
            fn assess(
                &self,
                measurement: &DiagnosisMeasurement,
                diagnosis_time: DateTime<Utc>,
                duration: Duration,
            ) -> impl std::future::Future<Output = Result<DiagnosisEntity, AssessmentError>> + Send
            {
                let id = measurement.measurement.id;
                async move {
                    let range_from = diagnosis_time - duration - Duration::seconds(40);
                    let range_until = diagnosis_time;
                    let at = |offset: i64| range_from + Duration::seconds(offset);
                    let content = |from: i64, until: i64| DiagnosisContent {
                        risk: None,
                        range_from: at(from),
                        range_until: at(until),
                        parameters: json!({}),
                    };
                    Ok(DiagnosisEntity {
                        diagnosis: Diagnosis {
                            id: 0,
                            measurement_id: id,
                            baseline_bpm: None,
                            maximum_risk: None,
                            memo: String::new(),
                            range_from,
                            range_until,
                            created_at: diagnosis_time,
                            modified_at: diagnosis_time,
                        },
                        algorithm_id: 1,
                        contents: vec![content(0, 30), content(30, 60), content(60, 90)],
                    })
                }
            }
        }

        // duration 50, cutoff 20: the diagnosis spans 90 seconds and the
        // margins cut 20 off each end, leaving only the middle entry.
        let window = MeasurementWindow::new(reference(), 50, 20, 0).unwrap();
        let measurements = vec![measurement_with_samples(1, 100)];

        let batch = run_batch(Arc::new(ContentAssessor), window, measurements, None).await;

        assert_eq!(batch.diagnoses.len(), 1);
        let entity = &batch.diagnoses[0];
        assert_eq!(entity.contents.len(), 1);
        assert_eq!(
            entity.contents[0].range_from,
            entity.diagnosis.range_from + Duration::seconds(30)
        );
    }

    #[derive(Clone, Copy)]
    enum RegisterBehavior {
        Succeed,
        Fail,
        Panic,
    }

    #[derive(Default)]
    struct SinkCalls {
        committed: AtomicUsize,
        rolled_back: AtomicUsize,
    }

    struct StubSink {
        behavior: RegisterBehavior,
        calls: Arc<SinkCalls>,
    }

    impl StubSink {
        fn new(behavior: RegisterBehavior) -> Self {
            Self {
                behavior,
                calls: Arc::new(SinkCalls::default()),
            }
        }
    }

    impl DiagnosisSink for StubSink {
        type Transaction = ();

        fn begin(&self) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
            async move { Ok(()) }
        }

        fn register(
            &self,
            _tx: &mut (),
            _entities: &[DiagnosisEntity],
        ) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
            let behavior = self.behavior;
            async move {
                match behavior {
                    RegisterBehavior::Succeed => Ok(()),
                    RegisterBehavior::Fail => Err(sqlx::Error::RowNotFound),
                    RegisterBehavior::Panic => panic!("registration blew up"),
                }
            }
        }

        fn commit(&self, _tx: ()) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
            async move {
                self.calls.committed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        fn rollback(&self, _tx: ()) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
            async move {
                self.calls.rolled_back.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn commits_only_after_successful_registration() {
        let sink = StubSink::new(RegisterBehavior::Succeed);
        let entities = vec![entity_with_contents((0, 90), &[(0, 30)])];

        persist_batch(&sink, &entities).await.unwrap();

        assert_eq!(sink.calls.committed.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls.rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registration_error_rolls_back_without_committing() {
        let sink = StubSink::new(RegisterBehavior::Fail);
        let entities = vec![
            entity_with_contents((0, 90), &[(0, 30)]),
            entity_with_contents((0, 90), &[(30, 60)]),
        ];

        let result = persist_batch(&sink, &entities).await;

        assert!(matches!(result, Err(PipelineError::Persistence(_))));
        assert_eq!(sink.calls.committed.load(Ordering::SeqCst), 0);
        assert_eq!(sink.calls.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_panic_rolls_back_and_surfaces_a_fault() {
        let sink = StubSink::new(RegisterBehavior::Panic);
        let entities = vec![entity_with_contents((0, 90), &[(0, 30)])];

        let result = persist_batch(&sink, &entities).await;

        match result {
            Err(PipelineError::Fault(message)) => {
                assert!(message.contains("registration blew up"));
            }
            other => panic!("expected a fault, got {other:?}"),
        }
        assert_eq!(sink.calls.committed.load(Ordering::SeqCst), 0);
        assert_eq!(sink.calls.rolled_back.load(Ordering::SeqCst), 1);
    }
}
