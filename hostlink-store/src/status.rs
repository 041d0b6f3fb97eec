use chrono::Utc;

use hostlink_core::error::HostlinkError;
use hostlink_core::host::HostStatus;

use crate::{CoordinationStore, db_err, timestamp};

impl CoordinationStore {
    pub async fn record_host_status(&self, status: &HostStatus) -> Result<(), HostlinkError> {
        let status_json = serde_json::to_string(status).map_err(HostlinkError::encode)?;
        sqlx::query(
            r#"
            INSERT INTO host_status (instance_id, status_json, heartbeat)
            VALUES (?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE SET
                status_json = excluded.status_json,
                heartbeat = excluded.heartbeat
            "#,
        )
        .bind(&status.instance_id)
        .bind(status_json)
        .bind(timestamp(status.heartbeat))
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Status for one instance, or the most recently seen one when
    /// `instance_id` is `None`.
    pub async fn host_status(
        &self,
        instance_id: Option<&str>,
    ) -> Result<Option<HostStatus>, HostlinkError> {
        let json: Option<String> = match instance_id {
            Some(instance_id) => {
                sqlx::query_scalar("SELECT status_json FROM host_status WHERE instance_id = ?")
                    .bind(instance_id)
                    .fetch_optional(self.pool.as_ref())
                    .await
            }
            None => {
                sqlx::query_scalar(
                    "SELECT status_json FROM host_status ORDER BY heartbeat DESC LIMIT 1",
                )
                .fetch_optional(self.pool.as_ref())
                .await
            }
        }
        .map_err(db_err)?;

        json.map(|json| serde_json::from_str::<HostStatus>(&json).map_err(HostlinkError::encode))
            .transpose()
    }

    pub async fn get_cursor(&self, key: &str) -> Result<Option<String>, HostlinkError> {
        sqlx::query_scalar("SELECT value FROM cursors WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)
    }

    pub async fn set_cursor(&self, key: &str, value: &str) -> Result<(), HostlinkError> {
        sqlx::query(
            r#"
            INSERT INTO cursors (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(timestamp(Utc::now()))
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_status_upserts_per_instance() {
        let store = CoordinationStore::in_memory().await.expect("store");
        let mut status = HostStatus::new("editor-1");
        store.record_host_status(&status).await.expect("record");

        status.compilation.is_compiling = true;
        status.heartbeat = Utc::now();
        store.record_host_status(&status).await.expect("record");

        let loaded = store
            .host_status(Some("editor-1"))
            .await
            .expect("load")
            .expect("present");
        assert!(loaded.compilation.is_compiling);
        assert_eq!(
            store.host_status(None).await.expect("latest").map(|s| s.instance_id),
            Some("editor-1".to_string())
        );
        assert!(store.host_status(Some("other")).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn cursor_roundtrip_overwrites() {
        let store = CoordinationStore::in_memory().await.expect("store");
        assert!(store.get_cursor("tail").await.expect("get").is_none());
        store.set_cursor("tail", "10").await.expect("set");
        store.set_cursor("tail", "42").await.expect("set");
        assert_eq!(store.get_cursor("tail").await.expect("get").as_deref(), Some("42"));
    }
}
