use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use hostlink_core::error::HostlinkError;

use crate::{CoordinationStore, db_err, timestamp};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub requests: u64,
    pub sessions: u64,
    pub logs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub requests_by_status: BTreeMap<String, u64>,
    pub sessions: u64,
    pub logs: u64,
    pub database_bytes: u64,
}

impl CoordinationStore {
    /// Delete terminal requests that finished before `cutoff` together with
    /// their results and history, and closed sessions that ended before it
    /// together with their logs. Pending, Running and the active session are
    /// never touched.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, HostlinkError> {
        let cutoff = timestamp(cutoff);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let terminal = r#"
            SELECT id FROM requests
            WHERE status IN ('completed', 'failed', 'cancelled', 'inconclusive')
              AND completed_at IS NOT NULL
              AND completed_at < ?
        "#;
        sqlx::query(&format!(
            "DELETE FROM request_results WHERE request_id IN ({terminal})"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(&format!(
            "DELETE FROM request_events WHERE request_id IN ({terminal})"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let requests = sqlx::query(&format!("DELETE FROM requests WHERE id IN ({terminal})"))
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let closed = r#"
            SELECT id FROM sessions
            WHERE end_time IS NOT NULL AND end_time < ?
        "#;
        let logs = sqlx::query(&format!("DELETE FROM logs WHERE session_id IN ({closed})"))
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        sqlx::query(&format!(
            "DELETE FROM drain_markers WHERE session_id IN ({closed})"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let sessions = sqlx::query(&format!("DELETE FROM sessions WHERE id IN ({closed})"))
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        tx.commit().await.map_err(db_err)?;

        let report = PruneReport {
            requests,
            sessions,
            logs,
        };
        info!(
            requests = report.requests,
            sessions = report.sessions,
            logs = report.logs,
            "store_pruned"
        );
        Ok(report)
    }

    pub async fn vacuum(&self) -> Result<(), HostlinkError> {
        sqlx::query("VACUUM")
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, HostlinkError> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM requests GROUP BY status ORDER BY status")
                .fetch_all(self.pool.as_ref())
                .await
                .map_err(db_err)?;
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        Ok(StoreStats {
            requests_by_status: by_status
                .into_iter()
                .map(|(status, count)| (status, count.max(0) as u64))
                .collect(),
            sessions: sessions.max(0) as u64,
            logs: logs.max(0) as u64,
            database_bytes: (page_count.max(0) as u64) * (page_size.max(0) as u64),
        })
    }
}
