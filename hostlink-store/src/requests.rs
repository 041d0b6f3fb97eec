use chrono::Utc;
use sqlx::prelude::FromRow;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use hostlink_core::error::{HostlinkError, RequestError};
use hostlink_core::request::{
    CancelOutcome, CoordinationRequest, NewRequest, RequestFinish, RequestId, RequestLookup,
    RequestResult, RequestSnapshot, RequestStatus, SubmitOutcome,
};

use crate::{CoordinationStore, db_err, parse_optional_timestamp, parse_timestamp, timestamp};

const REQUEST_COLUMNS: &str = "id, correlation_id, kind, payload, priority, status, created_at, \
                               started_at, completed_at, result_id";

/// Summary written for requests found Running after a teardown.
pub(crate) const INTERRUPTED_SUMMARY: &str =
    "host was torn down while the request was running; it may or may not have taken effect";

#[derive(Debug, FromRow)]
struct RequestRow {
    id: i64,
    correlation_id: String,
    kind: String,
    payload: Vec<u8>,
    priority: i64,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_id: Option<i64>,
}

#[derive(Debug, FromRow)]
struct ResultRow {
    id: i64,
    request_id: i64,
    summary: Option<String>,
    data_json: Option<String>,
    error_message: Option<String>,
    stack_trace: Option<String>,
    created_at: String,
}

/// A stored status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub request_id: RequestId,
    pub from_status: Option<RequestStatus>,
    pub to_status: RequestStatus,
    pub detail: Option<String>,
}

#[derive(Debug, FromRow)]
struct EventRow {
    request_id: i64,
    from_status: Option<String>,
    to_status: String,
    detail: Option<String>,
}

impl CoordinationStore {
    /// Insert a Pending request unless its correlation id is already known.
    /// Duplicates return the existing row untouched.
    pub async fn submit(&self, request: NewRequest) -> Result<SubmitOutcome, HostlinkError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO requests (correlation_id, kind, payload, priority, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(correlation_id) DO NOTHING
            "#,
        )
        .bind(&request.correlation_id)
        .bind(&request.kind)
        .bind(&request.payload)
        .bind(request.priority)
        .bind(timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let duplicate = inserted.rows_affected() == 0;
        if !duplicate {
            record_event(
                &mut tx,
                inserted.last_insert_rowid(),
                None,
                RequestStatus::Pending,
                None,
            )
            .await?;
        }
        tx.commit().await.map_err(db_err)?;

        let stored = self
            .get_request(&RequestLookup::Correlation(request.correlation_id.clone()))
            .await?
            .ok_or_else(|| {
                HostlinkError::database(format!(
                    "request '{}' vanished after submit",
                    request.correlation_id
                ))
            })?;

        if duplicate {
            if stored.kind != request.kind {
                warn!(
                    correlation_id = %request.correlation_id,
                    stored_kind = %stored.kind,
                    submitted_kind = %request.kind,
                    "duplicate_submit_kind_mismatch"
                );
            }
            debug!(
                request_id = stored.id,
                correlation_id = %stored.correlation_id,
                status = %stored.status,
                "duplicate_submit"
            );
        } else {
            info!(
                request_id = stored.id,
                correlation_id = %stored.correlation_id,
                kind = %stored.kind,
                priority = stored.priority,
                "request_submitted"
            );
        }

        Ok(SubmitOutcome {
            request: stored,
            duplicate,
        })
    }

    pub async fn get_request(
        &self,
        lookup: &RequestLookup,
    ) -> Result<Option<CoordinationRequest>, HostlinkError> {
        let row = match lookup {
            RequestLookup::Id(id) => {
                sqlx::query_as::<_, RequestRow>(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?"
                ))
                .bind(id)
                .fetch_optional(self.pool.as_ref())
                .await
            }
            RequestLookup::Correlation(correlation) => {
                sqlx::query_as::<_, RequestRow>(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests WHERE correlation_id = ?"
                ))
                .bind(correlation)
                .fetch_optional(self.pool.as_ref())
                .await
            }
        }
        .map_err(db_err)?;

        row.map(parse_request_row).transpose()
    }

    /// Current status plus the result row, if one was written.
    pub async fn poll(
        &self,
        lookup: &RequestLookup,
    ) -> Result<Option<RequestSnapshot>, HostlinkError> {
        let Some(request) = self.get_request(lookup).await? else {
            return Ok(None);
        };
        let result = match request.result_ref {
            Some(result_id) => self.get_result(result_id).await?,
            None => None,
        };
        Ok(Some(RequestSnapshot { request, result }))
    }

    async fn get_result(&self, result_id: i64) -> Result<Option<RequestResult>, HostlinkError> {
        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT id, request_id, summary, data_json, error_message, stack_trace, created_at
            FROM request_results
            WHERE id = ?
            "#,
        )
        .bind(result_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        row.map(parse_result_row).transpose()
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
    ) -> Result<Vec<CoordinationRequest>, HostlinkError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, RequestRow>(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests WHERE status = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(status.label())
                .bind(i64::from(limit))
                .fetch_all(self.pool.as_ref())
                .await
            }
            None => {
                sqlx::query_as::<_, RequestRow>(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests ORDER BY id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(self.pool.as_ref())
                .await
            }
        }
        .map_err(db_err)?;

        rows.into_iter().map(parse_request_row).collect()
    }

    /// Pending -> Cancelled. Any other current state is left alone.
    pub async fn cancel(&self, id: RequestId) -> Result<CancelOutcome, HostlinkError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE requests
            SET status = 'cancelled', completed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 1 {
            record_event(
                &mut tx,
                id,
                Some(RequestStatus::Pending),
                RequestStatus::Cancelled,
                None,
            )
            .await?;
            tx.commit().await.map_err(db_err)?;
            info!(request_id = id, "request_cancelled");
            return Ok(CancelOutcome::Cancelled);
        }
        tx.commit().await.map_err(db_err)?;

        match self.get_request(&RequestLookup::Id(id)).await? {
            Some(request) => {
                debug!(request_id = id, status = %request.status, "cancel_ignored_not_pending");
                Ok(CancelOutcome::NotPending(request.status))
            }
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Kinds that currently have Pending work, alphabetically.
    pub async fn pending_kinds(&self) -> Result<Vec<String>, HostlinkError> {
        sqlx::query_scalar(
            "SELECT DISTINCT kind FROM requests WHERE status = 'pending' ORDER BY kind ASC",
        )
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)
    }

    /// Atomically move the best Pending request of `kind` to Running. Nothing
    /// is claimed while another request of the same kind is Running.
    pub async fn claim_next(&self, kind: &str) -> Result<Option<CoordinationRequest>, HostlinkError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            UPDATE requests
            SET status = 'running', started_at = ?
            WHERE id = (
                SELECT id FROM requests
                WHERE kind = ? AND status = 'pending'
                ORDER BY priority DESC, id ASC
                LIMIT 1
            )
            AND NOT EXISTS (
                SELECT 1 FROM requests WHERE kind = ? AND status = 'running'
            )
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(timestamp(Utc::now()))
        .bind(kind)
        .bind(kind)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        record_event(
            &mut tx,
            row.id,
            Some(RequestStatus::Pending),
            RequestStatus::Running,
            None,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        let request = parse_request_row(row)?;
        info!(
            request_id = request.id,
            correlation_id = %request.correlation_id,
            kind = %request.kind,
            "request_claimed"
        );
        Ok(Some(request))
    }

    /// Write the result row and the terminal status together. Only a Running
    /// request can be finished.
    pub async fn finish(
        &self,
        id: RequestId,
        finish: RequestFinish,
    ) -> Result<RequestSnapshot, HostlinkError> {
        if !RequestStatus::Running.can_transition_to(finish.status) {
            return Err(RequestError::InvalidTransition {
                id,
                from: RequestStatus::Running,
                to: finish.status,
            }
            .into());
        }

        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE requests
            SET status = ?, completed_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(finish.status.label())
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return match self.get_request(&RequestLookup::Id(id)).await? {
                Some(current) => Err(RequestError::InvalidTransition {
                    id,
                    from: current.status,
                    to: finish.status,
                }
                .into()),
                None => Err(RequestError::NotFound(id).into()),
            };
        }

        let detail = finish.error_message.clone().or_else(|| finish.summary.clone());
        write_result(&mut tx, id, &finish, &now).await?;
        record_event(
            &mut tx,
            id,
            Some(RequestStatus::Running),
            finish.status,
            detail,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        info!(request_id = id, status = %finish.status, "request_finished");
        self.poll(&RequestLookup::Id(id))
            .await?
            .ok_or_else(|| RequestError::NotFound(id).into())
    }

    /// Turn requests left Running by a torn-down process into Inconclusive.
    pub async fn recover_interrupted(&self) -> Result<Vec<RequestId>, HostlinkError> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE requests
            SET status = 'inconclusive', completed_at = ?
            WHERE status = 'running'
            RETURNING id
            "#,
        )
        .bind(&now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let finish = RequestFinish::inconclusive(INTERRUPTED_SUMMARY);
        for id in &ids {
            write_result(&mut tx, *id, &finish, &now).await?;
            record_event(
                &mut tx,
                *id,
                Some(RequestStatus::Running),
                RequestStatus::Inconclusive,
                Some("recovered after restart".to_string()),
            )
            .await?;
        }
        tx.commit().await.map_err(db_err)?;

        if !ids.is_empty() {
            warn!(count = ids.len(), ?ids, "interrupted_requests_marked_inconclusive");
        }
        Ok(ids)
    }

    /// Transition history of one request, oldest first.
    pub async fn request_events(&self, id: RequestId) -> Result<Vec<RequestEvent>, HostlinkError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT request_id, from_status, to_status, detail
            FROM request_events
            WHERE request_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(RequestEvent {
                    request_id: row.request_id,
                    from_status: row.from_status.as_deref().map(parse_status).transpose()?,
                    to_status: parse_status(&row.to_status)?,
                    detail: row.detail,
                })
            })
            .collect()
    }
}

async fn write_result(
    tx: &mut Transaction<'_, Sqlite>,
    request_id: RequestId,
    finish: &RequestFinish,
    now: &str,
) -> Result<i64, HostlinkError> {
    let data_json = finish.data.as_ref().map(serde_json::Value::to_string);
    let inserted = sqlx::query(
        r#"
        INSERT INTO request_results (
            request_id, summary, data_json, error_message, stack_trace, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(request_id)
    .bind(&finish.summary)
    .bind(data_json)
    .bind(&finish.error_message)
    .bind(&finish.stack_trace)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    let result_id = inserted.last_insert_rowid();

    sqlx::query("UPDATE requests SET result_id = ? WHERE id = ?")
        .bind(result_id)
        .bind(request_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(result_id)
}

async fn record_event(
    tx: &mut Transaction<'_, Sqlite>,
    request_id: RequestId,
    from: Option<RequestStatus>,
    to: RequestStatus,
    detail: Option<String>,
) -> Result<(), HostlinkError> {
    sqlx::query(
        r#"
        INSERT INTO request_events (request_id, from_status, to_status, created_at, detail)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(request_id)
    .bind(from.map(|status| status.label()))
    .bind(to.label())
    .bind(timestamp(Utc::now()))
    .bind(detail)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn parse_status(raw: &str) -> Result<RequestStatus, HostlinkError> {
    raw.parse::<RequestStatus>().map_err(HostlinkError::database)
}

fn parse_request_row(row: RequestRow) -> Result<CoordinationRequest, HostlinkError> {
    Ok(CoordinationRequest {
        id: row.id,
        correlation_id: row.correlation_id,
        kind: row.kind,
        payload: row.payload,
        priority: row.priority,
        status: parse_status(&row.status)?,
        created_at: parse_timestamp(&row.created_at)?,
        started_at: parse_optional_timestamp(row.started_at.as_deref())?,
        completed_at: parse_optional_timestamp(row.completed_at.as_deref())?,
        result_ref: row.result_id,
    })
}

fn parse_result_row(row: ResultRow) -> Result<RequestResult, HostlinkError> {
    let data = row
        .data_json
        .as_deref()
        .map(|json| serde_json::from_str::<serde_json::Value>(json).map_err(HostlinkError::encode))
        .transpose()?;
    Ok(RequestResult {
        id: row.id,
        request_id: row.request_id,
        summary: row.summary,
        data,
        error_message: row.error_message,
        stack_trace: row.stack_trace,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
