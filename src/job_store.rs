//! Job Store (§4.C) — durable relational state: jobs, per-modality payload
//! rows, task rows, final decisions.
//!
//! Grounded on `bpmn_integration::correlation::CorrelationStore`: a thin
//! `PgPool`-wrapping struct with one `async fn` per query, `sqlx::query!`
//! macros, and `anyhow::Context` on every fallible call. The table shapes
//! come from `examples/original_source/apps/moderation_orchestrator/src/core/models.py`.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::model::{Job, Modality, Status, Task};

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> crate::error::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Insert a `pending` job row if one does not already exist for this
    /// correlation id. Returns `true` if a row was inserted.
    pub async fn ensure_job(&self, tx: &mut sqlx::PgConnection, correlation_id: Uuid) -> Result<bool> {
        let result = sqlx::query!(
            r#"
            INSERT INTO moderation_jobs (correlation_id, status)
            VALUES ($1, 'pending')
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
            correlation_id,
        )
        .execute(tx)
        .await
        .context("failed to insert moderation_jobs row")?;
        Ok(result.rows_affected() > 0)
    }

    /// Upsert the text payload row; presence of this row is the
    /// authoritative signal that the job has a text modality (§4.E.3).
    pub async fn upsert_text_payload(
        &self,
        tx: &mut sqlx::PgConnection,
        correlation_id: Uuid,
        excerpt: &str,
    ) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO text_data (correlation_id, text_excerpt)
            VALUES ($1, $2)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
            correlation_id,
            excerpt,
        )
        .execute(tx)
        .await
        .context("failed to upsert text_data row")?;
        Ok(())
    }

    pub async fn upsert_image_payload(
        &self,
        tx: &mut sqlx::PgConnection,
        correlation_id: Uuid,
        image_uri: &str,
    ) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO image_data (correlation_id, image_uri)
            VALUES ($1, $2)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
            correlation_id,
            image_uri,
        )
        .execute(tx)
        .await
        .context("failed to upsert image_data row")?;
        Ok(())
    }

    /// Which modalities this job has payload rows for — the authoritative
    /// source for target selection (§4.E.3), not the incoming event shape.
    pub async fn modalities_present(
        &self,
        tx: &mut sqlx::PgConnection,
        correlation_id: Uuid,
    ) -> Result<Vec<Modality>> {
        let mut modalities = Vec::new();
        let has_text = sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM text_data WHERE correlation_id = $1) AS "exists!""#,
            correlation_id,
        )
        .fetch_one(&mut *tx)
        .await
        .context("failed to check text_data presence")?;
        if has_text {
            modalities.push(Modality::Text);
        }
        let has_image = sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM image_data WHERE correlation_id = $1) AS "exists!""#,
            correlation_id,
        )
        .fetch_one(&mut *tx)
        .await
        .context("failed to check image_data presence")?;
        if has_image {
            modalities.push(Modality::Image);
        }
        Ok(modalities)
    }

    /// Insert a `pending` task row for `event_name` if it does not already
    /// exist. Returns `true` if a row was inserted (i.e. this target is new
    /// and must be published); an existing row means this is a no-op retry.
    pub async fn ensure_task(
        &self,
        tx: &mut sqlx::PgConnection,
        correlation_id: Uuid,
        event_name: &str,
    ) -> Result<bool> {
        let result = sqlx::query!(
            r#"
            INSERT INTO job_tasks (correlation_id, event_name, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (correlation_id, event_name) DO NOTHING
            "#,
            correlation_id,
            event_name,
        )
        .execute(tx)
        .await
        .context("failed to insert job_tasks row")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>> {
        self.pool.begin().await.context("failed to begin transaction")
    }

    pub async fn fetch_job(&self, correlation_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query!(
            r#"
            SELECT correlation_id, content_id, submitter_id,
                   status::text AS "status!", created_at, updated_at
            FROM moderation_jobs
            WHERE correlation_id = $1
            "#,
            correlation_id,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch moderation_jobs row")?;

        Ok(row.map(|r| Job {
            correlation_id: r.correlation_id,
            content_id: r.content_id,
            submitter_id: r.submitter_id,
            status: Status::parse(&r.status).unwrap_or(Status::Pending),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }))
    }

    pub async fn fetch_tasks(&self, correlation_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query!(
            r#"
            SELECT correlation_id, event_name, status::text AS "status!",
                   payload, started_at, completed_at
            FROM job_tasks
            WHERE correlation_id = $1
            ORDER BY event_name
            "#,
            correlation_id,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch job_tasks rows")?;

        Ok(rows
            .into_iter()
            .map(|r| Task {
                correlation_id: r.correlation_id,
                event_name: r.event_name,
                status: Status::parse(&r.status).unwrap_or(Status::Pending),
                payload: r.payload,
                started_at: r.started_at,
                completed_at: r.completed_at,
            })
            .collect())
    }

    /// UPSERT the final decision for a job and mark the job `completed`.
    /// Writes from the aggregator are keyed on the primary key per §4.C.
    pub async fn upsert_decision(
        &self,
        correlation_id: Uuid,
        final_verdict: &str,
        timed_out: bool,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query!(
            r#"
            INSERT INTO moderation_decisions (correlation_id, final_verdict, timed_out)
            VALUES ($1, $2::text::verdict, $3)
            ON CONFLICT (correlation_id)
            DO UPDATE SET final_verdict = EXCLUDED.final_verdict,
                          timed_out = EXCLUDED.timed_out,
                          decided_at = now()
            "#,
            correlation_id,
            final_verdict,
            timed_out,
        )
        .execute(&mut *tx)
        .await
        .context("failed to upsert moderation_decisions row")?;

        sqlx::query!(
            r#"
            UPDATE moderation_jobs
            SET status = 'completed', updated_at = $2
            WHERE correlation_id = $1
            "#,
            correlation_id,
            Utc::now(),
        )
        .execute(&mut *tx)
        .await
        .context("failed to mark moderation_jobs row completed")?;

        tx.commit().await.context("failed to commit decision upsert")?;
        Ok(())
    }
}
