//! Status store on the `jobs` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::StatusStore;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus, Outcome, StatusRecord};

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    function: String,
    status: String,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<serde_json::Value>,
}

impl JobRow {
    fn try_into_record(self) -> Result<StatusRecord> {
        Ok(StatusRecord {
            job_id: JobId(self.id),
            status: self.status.parse()?,
            function: Some(self.function),
            submitted_at: Some(self.submitted_at),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome.map(serde_json::from_value).transpose()?,
        })
    }
}

impl super::Db {
    /// Current status of a live (unexpired) job, if any.
    async fn current_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM jobs WHERE id = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(s,)| s.parse()).transpose()
    }

    /// Turn a zero-row update into the precise error.
    async fn rejected(&self, id: JobId, to: JobStatus) -> Error {
        match self.current_status(id).await {
            Ok(Some(from)) => Error::InvalidTransition { from, to },
            Ok(None) => Error::NotFound(format!("job {id}")),
            Err(e) => e,
        }
    }

    /// Delete finished jobs past their retention window.
    pub async fn purge_expired(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM jobs WHERE expires_at <= now()")
            .execute(self.pool())
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl StatusStore for super::Db {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.purge_expired().await?;
        sqlx::query(
            "INSERT INTO jobs (id, function, status, submitted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(job.id.0)
        .bind(&job.payload.function)
        .bind(JobStatus::Pending.to_string())
        .bind(job.submitted_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn discard(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<()> {
        if !from.can_transition_to(to) || to.is_terminal() {
            return Err(Error::InvalidTransition { from, to });
        }
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = $1,
                    started_at = CASE WHEN $1 = 'running' THEN now() ELSE started_at END
             WHERE id = $2 AND status = $3",
        )
        .bind(to.to_string())
        .bind(id.0)
        .bind(from.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejected(id, to).await);
        }
        Ok(())
    }

    async fn record_outcome(&self, id: JobId, status: JobStatus, outcome: &Outcome) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: JobStatus::Running,
                to: status,
            });
        }
        let allowed_from: Vec<String> = [JobStatus::Pending, JobStatus::Running]
            .into_iter()
            .filter(|from| from.can_transition_to(status))
            .map(|from| from.to_string())
            .collect();

        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = $1, outcome = $2, finished_at = now(),
                    expires_at = now() + make_interval(secs => $3)
             WHERE id = $4 AND status = ANY($5)",
        )
        .bind(status.to_string())
        .bind(serde_json::to_value(outcome)?)
        .bind(self.retention.as_secs_f64())
        .bind(id.0)
        .bind(&allowed_from)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejected(id, status).await);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<StatusRecord> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, function, status, submitted_at, started_at, finished_at, outcome
             FROM jobs WHERE id = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into_record(),
            None => Ok(StatusRecord::not_found(id)),
        }
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM jobs WHERE status = 'running' AND started_at < $1")
                .bind(cutoff)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }
}
