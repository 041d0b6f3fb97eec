use std::collections::HashMap;

use sqlx::prelude::FromRow;
use tracing::debug;

use hostlink_core::error::HostlinkError;
use hostlink_core::log::{COMPILER_CONTEXT, LogEntry, LogLevel, LogQuery};
use hostlink_core::session::{SessionId, SessionSummary};

use crate::{CoordinationStore, db_err, parse_timestamp, timestamp};

const LOG_COLUMNS: &str = "session_id, sequence, timestamp, level, message, stack_trace, \
                           truncated_stack, source_file, source_line, context, request_id";

#[derive(Debug, FromRow)]
struct LogRow {
    session_id: String,
    sequence: i64,
    timestamp: String,
    level: String,
    message: String,
    stack_trace: Option<String>,
    truncated_stack: Option<String>,
    source_file: Option<String>,
    source_line: Option<i64>,
    context: Option<String>,
    request_id: Option<i64>,
}

#[derive(Debug, FromRow)]
struct LevelCountRow {
    level: String,
    count: i64,
    first_log: Option<String>,
    last_log: Option<String>,
}

impl CoordinationStore {
    /// Persist entries and advance each session's drain marker in the same
    /// transaction. Rows already present are skipped, so replaying a drain
    /// is harmless. Returns the number of rows actually inserted.
    pub async fn append_logs(&self, entries: &[LogEntry]) -> Result<u64, HostlinkError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut markers: HashMap<SessionId, u64> = HashMap::new();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entry in entries {
            let result = sqlx::query(&format!(
                "INSERT OR IGNORE INTO logs ({LOG_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(entry.session_id.to_string())
            .bind(entry.sequence as i64)
            .bind(timestamp(entry.timestamp))
            .bind(entry.level.label())
            .bind(&entry.message)
            .bind(&entry.stack_trace)
            .bind(&entry.truncated_stack)
            .bind(&entry.source_file)
            .bind(entry.source_line.map(i64::from))
            .bind(&entry.context)
            .bind(entry.request_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected();

            let marker = markers.entry(entry.session_id).or_default();
            *marker = (*marker).max(entry.sequence);
        }

        for (session_id, sequence) in &markers {
            sqlx::query(
                r#"
                INSERT INTO drain_markers (session_id, last_sequence)
                VALUES (?, ?)
                ON CONFLICT(session_id) DO UPDATE SET
                    last_sequence = max(last_sequence, excluded.last_sequence)
                "#,
            )
            .bind(session_id.to_string())
            .bind(*sequence as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(
            submitted = entries.len(),
            inserted,
            sessions = markers.len(),
            "logs_appended"
        );
        Ok(inserted)
    }

    /// Highest sequence persisted for `session`, or 0.
    pub async fn last_drained_sequence(&self, session: SessionId) -> Result<u64, HostlinkError> {
        let marker: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM drain_markers WHERE session_id = ?")
                .bind(session.to_string())
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(db_err)?;
        Ok(marker.map(|value| value.max(0) as u64).unwrap_or(0))
    }

    pub async fn drain_markers(&self) -> Result<HashMap<SessionId, u64>, HostlinkError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT session_id, last_sequence FROM drain_markers")
                .fetch_all(self.pool.as_ref())
                .await
                .map_err(db_err)?;
        rows.into_iter()
            .map(|(session, sequence)| {
                let session = session
                    .parse::<SessionId>()
                    .map_err(HostlinkError::database)?;
                Ok((session, sequence.max(0) as u64))
            })
            .collect()
    }

    /// Stored entries matching `query`, oldest first.
    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, HostlinkError> {
        let mut conditions = Vec::new();
        let mut bind_values: Vec<String> = Vec::new();

        if let Some(session) = query.session_id {
            conditions.push("session_id = ?".to_string());
            bind_values.push(session.to_string());
        }

        if !query.levels.is_empty() {
            let placeholders = std::iter::repeat_n("?", query.levels.len())
                .collect::<Vec<_>>()
                .join(", ");
            conditions.push(format!("level IN ({placeholders})"));
            bind_values.extend(query.levels.iter().map(|level| level.label().to_string()));
        }

        if query.critical_only {
            let critical: Vec<LogLevel> = LogLevel::ALL
                .into_iter()
                .filter(LogLevel::is_critical)
                .collect();
            let placeholders = std::iter::repeat_n("?", critical.len())
                .collect::<Vec<_>>()
                .join(", ");
            conditions.push(format!("(level IN ({placeholders}) OR context = ?)"));
            bind_values.extend(critical.iter().map(|level| level.label().to_string()));
            bind_values.push(COMPILER_CONTEXT.to_string());
        }

        if let Some(request_id) = query.request_id {
            conditions.push("request_id = ?".to_string());
            bind_values.push(request_id.to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = match query.limit {
            Some(limit) => format!(
                "SELECT {LOG_COLUMNS} FROM logs {where_clause} ORDER BY id DESC LIMIT {limit}"
            ),
            None => format!("SELECT {LOG_COLUMNS} FROM logs {where_clause} ORDER BY id ASC"),
        };

        let mut sql_query = sqlx::query_as::<_, LogRow>(&sql);
        for value in &bind_values {
            sql_query = sql_query.bind(value);
        }
        let rows = sql_query
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        let mut entries = rows
            .into_iter()
            .map(parse_log_row)
            .collect::<Result<Vec<_>, _>>()?;
        if query.limit.is_some() {
            entries.reverse();
        }
        Ok(entries)
    }

    /// Per-level counts and the first/last timestamps of one session.
    pub async fn session_summary(&self, session: SessionId) -> Result<SessionSummary, HostlinkError> {
        let rows = sqlx::query_as::<_, LevelCountRow>(
            r#"
            SELECT level, COUNT(*) AS count, MIN(timestamp) AS first_log, MAX(timestamp) AS last_log
            FROM logs
            WHERE session_id = ?
            GROUP BY level
            "#,
        )
        .bind(session.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let mut summary = SessionSummary {
            session_id: Some(session),
            ..SessionSummary::default()
        };
        for row in rows {
            let count = row.count.max(0) as u64;
            summary.total += count;
            match row.level.parse::<LogLevel>().map_err(HostlinkError::database)? {
                LogLevel::Info => summary.info += count,
                LogLevel::Warning => summary.warning += count,
                LogLevel::Error => summary.error += count,
                LogLevel::Exception => summary.exception += count,
                LogLevel::Assert => summary.assert += count,
            }
            if let Some(first) = row.first_log.as_deref() {
                let first = parse_timestamp(first)?;
                summary.first_log = Some(summary.first_log.map_or(first, |cur| cur.min(first)));
            }
            if let Some(last) = row.last_log.as_deref() {
                let last = parse_timestamp(last)?;
                summary.last_log = Some(summary.last_log.map_or(last, |cur| cur.max(last)));
            }
        }
        Ok(summary)
    }
}

fn parse_log_row(row: LogRow) -> Result<LogEntry, HostlinkError> {
    Ok(LogEntry {
        session_id: row
            .session_id
            .parse::<SessionId>()
            .map_err(HostlinkError::database)?,
        sequence: row.sequence.max(0) as u64,
        timestamp: parse_timestamp(&row.timestamp)?,
        level: row.level.parse::<LogLevel>().map_err(HostlinkError::database)?,
        message: row.message,
        stack_trace: row.stack_trace,
        truncated_stack: row.truncated_stack,
        source_file: row.source_file,
        source_line: row.source_line.and_then(|line| u32::try_from(line).ok()),
        context: row.context,
        request_id: row.request_id,
    })
}
