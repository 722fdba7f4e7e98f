use sqlx::PgPool;

use crate::db::models::ResultCriterion;
use crate::services::rubric::RubricCriterionScore;

const COLUMNS: &str = "\
    id, result_id, position, criterion_id, name, score, max_score, level_id, level_label, feedback";

pub(crate) async fn insert_all(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    result_id: &str,
    criteria: &[RubricCriterionScore],
) -> Result<(), sqlx::Error> {
    for (position, criterion) in criteria.iter().enumerate() {
        let feedback = Some(criterion.feedback.as_str()).filter(|text| !text.is_empty());
        sqlx::query(
            "INSERT INTO grading_result_criteria (
                id, result_id, position, criterion_id, name, score, max_score, level_id,
                level_label, feedback
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(result_id)
        .bind(position as i32)
        .bind(&criterion.criterion_id)
        .bind(&criterion.name)
        .bind(criterion.score)
        .bind(criterion.max_score)
        .bind(criterion.level.as_ref().map(|level| level.id.as_str()))
        .bind(criterion.level.as_ref().map(|level| level.label.as_str()))
        .bind(feedback)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

pub(crate) async fn list_by_result(
    pool: &PgPool,
    result_id: &str,
) -> Result<Vec<ResultCriterion>, sqlx::Error> {
    sqlx::query_as::<_, ResultCriterion>(&format!(
        "SELECT {COLUMNS}
         FROM grading_result_criteria
         WHERE result_id = $1
         ORDER BY position"
    ))
    .bind(result_id)
    .fetch_all(pool)
    .await
}
