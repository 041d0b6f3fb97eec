use chrono::Utc;
use sqlx::prelude::FromRow;
use tracing::info;

use hostlink_core::error::HostlinkError;
use hostlink_core::session::{Session, SessionId, SessionStartReason};

use crate::{CoordinationStore, db_err, parse_optional_timestamp, parse_timestamp, timestamp};

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    start_reason: String,
    start_time: String,
    end_time: Option<String>,
}

impl CoordinationStore {
    /// Close the active session, if any, and open a new one starting at the
    /// instant the old one ended.
    pub async fn open_session(&self, reason: SessionStartReason) -> Result<Session, HostlinkError> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // max() keeps the boundary monotonic if the wall clock stepped back.
        let closed_at: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET end_time = max(start_time, ?)
            WHERE end_time IS NULL
            RETURNING end_time
            "#,
        )
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let start_time = closed_at.unwrap_or(now);
        let session = Session {
            id: SessionId::new_v4(),
            start_reason: reason,
            start_time: parse_timestamp(&start_time)?,
            end_time: None,
        };
        sqlx::query(
            r#"
            INSERT INTO sessions (id, start_reason, start_time, end_time)
            VALUES (?, ?, ?, NULL)
            "#,
        )
        .bind(session.id.to_string())
        .bind(reason.label())
        .bind(&start_time)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        info!(session_id = %session.id, reason = %reason, "session_started");
        Ok(session)
    }

    pub async fn active_session(&self) -> Result<Option<Session>, HostlinkError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, start_reason, start_time, end_time
            FROM sessions
            WHERE end_time IS NULL
            "#,
        )
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        row.map(parse_session_row).transpose()
    }

    /// Most recent sessions first.
    pub async fn list_sessions(&self, limit: u32) -> Result<Vec<Session>, HostlinkError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, start_reason, start_time, end_time
            FROM sessions
            ORDER BY start_time DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter().map(parse_session_row).collect()
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Option<Session>, HostlinkError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, start_reason, start_time, end_time
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        row.map(parse_session_row).transpose()
    }
}

fn parse_session_row(row: SessionRow) -> Result<Session, HostlinkError> {
    Ok(Session {
        id: row.id.parse::<SessionId>().map_err(HostlinkError::database)?,
        start_reason: row
            .start_reason
            .parse::<SessionStartReason>()
            .map_err(HostlinkError::database)?,
        start_time: parse_timestamp(&row.start_time)?,
        end_time: parse_optional_timestamp(row.end_time.as_deref())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opening_closes_previous_at_the_same_instant() {
        let store = CoordinationStore::in_memory().await.expect("store");
        let first = store
            .open_session(SessionStartReason::HostStart)
            .await
            .expect("open");
        let second = store
            .open_session(SessionStartReason::CleanCompile)
            .await
            .expect("open");

        let closed = store
            .get_session(first.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(closed.end_time, Some(second.start_time));
        assert!(!closed.overlaps(&second));

        let active = store.active_session().await.expect("active").expect("one");
        assert_eq!(active.id, second.id);
        assert_eq!(active.start_reason, SessionStartReason::CleanCompile);
    }

    #[tokio::test]
    async fn sessions_never_overlap() {
        let store = CoordinationStore::in_memory().await.expect("store");
        for reason in [
            SessionStartReason::HostStart,
            SessionStartReason::ManualClear,
            SessionStartReason::Reload,
            SessionStartReason::ExternalClear,
        ] {
            store.open_session(reason).await.expect("open");
        }
        let sessions = store.list_sessions(10).await.expect("list");
        assert_eq!(sessions.len(), 4);
        assert_eq!(sessions.iter().filter(|s| s.is_active()).count(), 1);
        for (i, a) in sessions.iter().enumerate() {
            for b in sessions.iter().skip(i + 1) {
                assert!(!a.overlaps(b), "{} overlaps {}", a.id, b.id);
            }
        }
    }

    #[tokio::test]
    async fn second_active_row_is_rejected_by_schema() {
        let store = CoordinationStore::in_memory().await.expect("store");
        store
            .open_session(SessionStartReason::HostStart)
            .await
            .expect("open");
        let result = sqlx::query(
            "INSERT INTO sessions (id, start_reason, start_time, end_time) VALUES (?, 'reload', ?, NULL)",
        )
        .bind(SessionId::new_v4().to_string())
        .bind(timestamp(Utc::now()))
        .execute(store.pool.as_ref())
        .await;
        assert!(result.is_err());
    }
}
