//! Postgres-backed status store.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE job_statuses (
//!     id            UUID PRIMARY KEY,
//!     actor_id      UUID NOT NULL,
//!     kind          TEXT NOT NULL,
//!     arg_signature TEXT NOT NULL,
//!     state         TEXT NOT NULL,
//!     error         TEXT,
//!     created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE UNIQUE INDEX job_statuses_open_identity
//!     ON job_statuses (actor_id, kind, arg_signature)
//!     WHERE state IN ('queued', 'executing');
//! ```
//!
//! The partial unique index is the source of truth for open-record
//! idempotence: `find_or_create` inserts with `ON CONFLICT DO NOTHING` and
//! then fetches whichever row won, so racing creators converge without a
//! duplicate-key error ever reaching the caller. Terminal rows fall out of
//! the index and remain as history.
//!
//! ## Thread Safety
//!
//! Uses the SQLx connection pool (Arc + Send + Sync). The synchronous
//! `StatusStore` trait is bridged onto the pool with
//! `tokio::runtime::Handle::block_on`, so calls must happen where a Tokio
//! runtime is reachable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tallyforge_core::UserId;
use tallyforge_coordination::{Fingerprint, JobKind, JobState, StatusError, StatusRecord, StatusStore};

pub struct PostgresStatusStore {
    pool: Arc<PgPool>,
}

impl PostgresStatusStore {
    /// Create a new PostgresStatusStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn block_on<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StatusError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| StatusError::Unavailable("no tokio runtime available".to_string()))?;
        handle.block_on(fut).map_err(map_sqlx_error)
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StatusError {
    StatusError::Unavailable(error.to_string())
}

fn state_to_str(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Executing => "executing",
        JobState::Succeeded => "succeeded",
        JobState::Failed => "failed",
    }
}

fn state_from_str(state: &str) -> Option<JobState> {
    match state {
        "queued" => Some(JobState::Queued),
        "executing" => Some(JobState::Executing),
        "succeeded" => Some(JobState::Succeeded),
        "failed" => Some(JobState::Failed),
        _ => None,
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<StatusRecord, StatusError> {
    let state_raw: String = row
        .try_get("state")
        .map_err(|e| StatusError::Unavailable(e.to_string()))?;
    let state = state_from_str(&state_raw)
        .ok_or_else(|| StatusError::Unavailable(format!("unknown status state: {state_raw}")))?;

    let read = |column: &str| -> Result<Uuid, StatusError> {
        row.try_get(column)
            .map_err(|e| StatusError::Unavailable(e.to_string()))
    };

    Ok(StatusRecord {
        id: read("id")?,
        actor: UserId::from_uuid(read("actor_id")?),
        kind: JobKind::new(
            row.try_get::<String, _>("kind")
                .map_err(|e| StatusError::Unavailable(e.to_string()))?,
        ),
        arg_signature: Fingerprint::from_hex(
            row.try_get::<String, _>("arg_signature")
                .map_err(|e| StatusError::Unavailable(e.to_string()))?,
        ),
        state,
        error: row
            .try_get::<Option<String>, _>("error")
            .map_err(|e| StatusError::Unavailable(e.to_string()))?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| StatusError::Unavailable(e.to_string()))?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(|e| StatusError::Unavailable(e.to_string()))?,
    })
}

const SELECT_OPEN: &str = r#"
    SELECT id, actor_id, kind, arg_signature, state, error, created_at, updated_at
    FROM job_statuses
    WHERE actor_id = $1 AND kind = $2 AND arg_signature = $3
      AND state IN ('queued', 'executing')
"#;

impl StatusStore for PostgresStatusStore {
    fn find_or_create(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<StatusRecord, StatusError> {
        let pool = self.pool.clone();
        let actor_uuid = *actor.as_uuid();
        let kind = kind.clone();
        let signature = signature.clone();

        self.block_on(async move {
            // The partial unique index swallows the losing creator's insert.
            sqlx::query(
                r#"
                INSERT INTO job_statuses (id, actor_id, kind, arg_signature, state)
                VALUES ($1, $2, $3, $4, 'queued')
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(actor_uuid)
            .bind(kind.as_str())
            .bind(signature.as_str())
            .execute(&*pool)
            .await?;

            let row = sqlx::query(SELECT_OPEN)
                .bind(actor_uuid)
                .bind(kind.as_str())
                .bind(signature.as_str())
                .fetch_one(&*pool)
                .await?;

            Ok(row)
        })
        .and_then(|row| record_from_row(&row))
    }

    fn get_open(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<Option<StatusRecord>, StatusError> {
        let pool = self.pool.clone();
        let actor_uuid = *actor.as_uuid();
        let kind = kind.clone();
        let signature = signature.clone();

        let row = self.block_on(async move {
            sqlx::query(SELECT_OPEN)
                .bind(actor_uuid)
                .bind(kind.as_str())
                .bind(signature.as_str())
                .fetch_optional(&*pool)
                .await
        })?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    fn mark_executing(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        let pool = self.pool.clone();
        let actor_uuid = *actor.as_uuid();
        let kind = kind.clone();
        let signature = signature.clone();

        self.block_on(async move {
            // Absent rows are a no-op: untracked jobs run without status.
            sqlx::query(
                r#"
                UPDATE job_statuses
                SET state = 'executing', updated_at = NOW()
                WHERE actor_id = $1 AND kind = $2 AND arg_signature = $3
                  AND state = 'queued'
                "#,
            )
            .bind(actor_uuid)
            .bind(kind.as_str())
            .bind(signature.as_str())
            .execute(&*pool)
            .await?;
            Ok(())
        })
    }

    fn mark_succeeded(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
    ) -> Result<(), StatusError> {
        self.finalize(actor, kind, signature, JobState::Succeeded, None)
    }

    fn mark_failed(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
        error: &str,
    ) -> Result<(), StatusError> {
        self.finalize(
            actor,
            kind,
            signature,
            JobState::Failed,
            Some(error.to_string()),
        )
    }
}

impl PostgresStatusStore {
    fn finalize(
        &self,
        actor: UserId,
        kind: &JobKind,
        signature: &Fingerprint,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), StatusError> {
        let pool = self.pool.clone();
        let actor_uuid = *actor.as_uuid();
        let kind = kind.clone();
        let signature = signature.clone();
        let state = state_to_str(state);

        self.block_on(async move {
            sqlx::query(
                r#"
                UPDATE job_statuses
                SET state = $4, error = $5, updated_at = NOW()
                WHERE actor_id = $1 AND kind = $2 AND arg_signature = $3
                  AND state IN ('queued', 'executing')
                "#,
            )
            .bind(actor_uuid)
            .bind(kind.as_str())
            .bind(signature.as_str())
            .bind(state)
            .bind(error)
            .execute(&*pool)
            .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Executing,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(state_from_str(state_to_str(state)), Some(state));
        }
    }

    #[test]
    fn unknown_state_strings_are_rejected() {
        assert_eq!(state_from_str("paused"), None);
    }
}
