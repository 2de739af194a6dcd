use crate::models::{DiagnosisAlgorithm, DiagnosisContent, DiagnosisEntity};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};

pub async fn fetch_algorithm_by_name(
    pool: &PgPool,
    name: &str,
    version: &str,
) -> Result<Option<DiagnosisAlgorithm>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, name, version
        FROM diagnosis_algorithm
        WHERE name = $1 AND version = $2
        "#,
    )
    .bind(name)
    .bind(version)
    .fetch_optional(pool)
    .await
}

/// Writes every diagnosis of a run inside the caller's transaction: the
/// diagnosis rows, their algorithm links and content rows, then the merge of
/// each diagnosis into its measurement's computed-event timeline. The caller
/// decides commit or rollback.
pub async fn register_diagnoses(
    tx: &mut Transaction<'_, Postgres>,
    entities: &[DiagnosisEntity],
) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    for entity in entities {
        let (diagnosis_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO diagnosis (
              measurement_id, baseline_bpm, maximum_risk, memo,
              range_from, range_until, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(entity.diagnosis.measurement_id)
        .bind(entity.diagnosis.baseline_bpm)
        .bind(entity.diagnosis.maximum_risk)
        .bind(&entity.diagnosis.memo)
        .bind(entity.diagnosis.range_from)
        .bind(entity.diagnosis.range_until)
        .bind(entity.diagnosis.created_at)
        .bind(entity.diagnosis.modified_at)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO computed_diagnosis (diagnosis_id, algorithm_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(diagnosis_id)
        .bind(entity.algorithm_id)
        .execute(&mut **tx)
        .await?;

        for content in &entity.contents {
            sqlx::query(
                r#"
                INSERT INTO diagnosis_content (
                  diagnosis_id, risk, range_from, range_until, parameters
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(diagnosis_id)
            .bind(content.risk)
            .bind(content.range_from)
            .bind(content.range_until)
            .bind(&content.parameters)
            .execute(&mut **tx)
            .await?;
        }
    }

    for entity in entities {
        merge_new_diagnosis(tx, entity.diagnosis.measurement_id, &entity.contents, now).await?;
    }

    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct ComputedEventRow {
    id: i64,
    range_from: DateTime<Utc>,
    range_until: DateTime<Utc>,
}

#[derive(Debug)]
struct LatestEventUpdate {
    id: i64,
    risk: Option<i32>,
    range_until: DateTime<Utc>,
    parameters: JsonValue,
}

#[derive(Debug)]
struct MergePlan<'a> {
    update: Option<LatestEventUpdate>,
    inserts: &'a [DiagnosisContent],
}

/// Decides how new diagnosis contents fold into the existing computed-event
/// timeline. Contents that ended before the latest known event began are
/// stale and dropped; contents overlapping the latest event extend it in
/// place (chained, so each absorbed content moves the comparison bound); the
/// rest become new events.
fn plan_merge<'a>(
    latest: Option<&ComputedEventRow>,
    contents: &'a [DiagnosisContent],
) -> MergePlan<'a> {
    let Some(latest) = latest else {
        return MergePlan {
            update: None,
            inserts: contents,
        };
    };

    let stale = contents
        .iter()
        .take_while(|content| content.range_until < latest.range_from)
        .count();
    let remaining = &contents[stale..];

    let mut update: Option<LatestEventUpdate> = None;
    let mut latest_until = latest.range_until;
    let mut absorbed = 0;
    for content in remaining {
        if content.range_from >= latest_until {
            break;
        }
        absorbed += 1;
        latest_until = content.range_until;
        update = Some(LatestEventUpdate {
            id: latest.id,
            risk: content.risk,
            range_until: content.range_until,
            parameters: content.parameters.clone(),
        });
    }

    MergePlan {
        update,
        inserts: &remaining[absorbed..],
    }
}

/// Connects a new diagnosis's contents to the measurement's computed events.
async fn merge_new_diagnosis(
    tx: &mut Transaction<'_, Postgres>,
    measurement_id: i64,
    contents: &[DiagnosisContent],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if contents.is_empty() {
        return Ok(());
    }

    let events: Vec<ComputedEventRow> = sqlx::query_as(
        r#"
        SELECT id, range_from, range_until
        FROM computed_event
        WHERE measurement_id = $1 AND range_until >= $2
        ORDER BY range_from ASC
        "#,
    )
    .bind(measurement_id)
    .bind(contents[0].range_from)
    .fetch_all(&mut **tx)
    .await?;

    let plan = plan_merge(events.last(), contents);

    if let Some(update) = &plan.update {
        sqlx::query(
            r#"
            UPDATE computed_event
            SET risk = $2, range_until = $3, parameters = $4, modified_at = $5
            WHERE id = $1
            "#,
        )
        .bind(update.id)
        .bind(update.risk)
        .bind(update.range_until)
        .bind(&update.parameters)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }

    for content in plan.inserts {
        sqlx::query(
            r#"
            INSERT INTO computed_event (
              measurement_id, risk, memo, parameters, is_hidden,
              range_from, range_until, created_at, modified_at
            )
            VALUES ($1, $2, '', $3, false, $4, $5, $6, $6)
            "#,
        )
        .bind(measurement_id)
        .bind(content.risk)
        .bind(&content.parameters)
        .bind(content.range_from)
        .bind(content.range_until)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}
