use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::Instant;

use hostlink_core::log::{LogEntry, LogQuery};
use hostlink_core::request::{CancelOutcome, NewRequest, RequestLookup, RequestSnapshot};
use hostlink_core::session::SessionId;
use hostlink_store::CoordinationStore;

use crate::CliError;
use crate::cli::{CleanArgs, ListArgs, LogsArgs, PollingArgs, SubmitArgs};

pub async fn submit(store: &CoordinationStore, args: SubmitArgs) -> Result<Value, CliError> {
    let payload = match (&args.payload, &args.payload_file) {
        (Some(inline), _) => inline.as_bytes().to_vec(),
        (None, Some(path)) => read_payload(path)?,
        (None, None) => Vec::new(),
    };
    let correlation = args.correlation.clone().unwrap_or_else(generated_correlation);
    let outcome = store
        .submit(
            NewRequest::new(correlation, args.kind.clone())
                .with_priority(args.priority)
                .with_payload(payload),
        )
        .await?;

    if args.wait {
        let lookup = RequestLookup::Id(outcome.request.id);
        let snapshot = wait_for(store, &lookup, &args.polling).await?;
        let mut view = snapshot_view(&snapshot);
        view["duplicate"] = json!(outcome.duplicate);
        return Ok(view);
    }

    let snapshot = store
        .poll(&RequestLookup::Id(outcome.request.id))
        .await?
        .ok_or_else(|| CliError::NotFound(format!("request #{} vanished", outcome.request.id)))?;
    let mut view = snapshot_view(&snapshot);
    view["duplicate"] = json!(outcome.duplicate);
    Ok(view)
}

fn read_payload(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path)
        .map_err(|err| CliError::Usage(format!("reading payload {}: {err}", path.display())))
}

fn generated_correlation() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("cli-{nanos:x}-{}", std::process::id())
}

pub async fn status(store: &CoordinationStore, lookup: &RequestLookup) -> Result<Value, CliError> {
    let snapshot = store
        .poll(lookup)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("request {lookup} not found")))?;
    Ok(snapshot_view(&snapshot))
}

pub async fn wait(
    store: &CoordinationStore,
    lookup: &RequestLookup,
    polling: &PollingArgs,
) -> Result<Value, CliError> {
    let snapshot = wait_for(store, lookup, polling).await?;
    Ok(snapshot_view(&snapshot))
}

/// Poll until terminal. The timeout belongs to the driver; the host never
/// gives up on a Running request by itself.
async fn wait_for(
    store: &CoordinationStore,
    lookup: &RequestLookup,
    polling: &PollingArgs,
) -> Result<RequestSnapshot, CliError> {
    let deadline = Instant::now() + polling.timeout;
    loop {
        let snapshot = store
            .poll(lookup)
            .await?
            .ok_or_else(|| CliError::NotFound(format!("request {lookup} not found")))?;
        if snapshot.request.status.is_terminal() {
            return Ok(snapshot);
        }
        if Instant::now() >= deadline {
            let host = match store.host_status(None).await? {
                Some(host) if host.compilation.is_compiling => "; host is compiling".to_string(),
                Some(host) => format!("; host heartbeat {}", host.heartbeat.to_rfc3339()),
                None => "; no host has reported status".to_string(),
            };
            return Err(CliError::Timeout(format!(
                "request {lookup} still {} after {}{host}",
                snapshot.request.status,
                humantime::format_duration(polling.timeout)
            )));
        }
        tokio::time::sleep(polling.interval.min(Duration::from_secs(5))).await;
    }
}

pub async fn cancel(store: &CoordinationStore, id: i64) -> Result<Value, CliError> {
    match store.cancel(id).await? {
        CancelOutcome::NotFound => Err(CliError::NotFound(format!("request #{id} not found"))),
        outcome => Ok(json!({ "id": id, "cancel": outcome })),
    }
}

pub async fn list(store: &CoordinationStore, args: ListArgs) -> Result<Value, CliError> {
    let requests = store.list_requests(args.status, args.limit).await?;
    let rows: Vec<Value> = requests
        .iter()
        .map(|request| {
            json!({
                "id": request.id,
                "correlation_id": request.correlation_id,
                "kind": request.kind,
                "priority": request.priority,
                "status": request.status,
                "created_at": request.created_at,
                "completed_at": request.completed_at,
            })
        })
        .collect();
    Ok(json!(rows))
}

pub async fn logs(
    store: &CoordinationStore,
    args: LogsArgs,
    json_mode: bool,
) -> Result<Value, CliError> {
    let session = resolve_session(store, args.session.as_deref()).await?;
    let mut query = LogQuery::for_session(session)
        .with_levels(args.levels)
        .with_limit(args.limit);
    if args.errors {
        query = query.critical();
    }
    query.request_id = args.request;

    let entries = store.query_logs(&query).await?;
    if json_mode {
        return Ok(json!({ "session_id": session, "entries": entries }));
    }
    let rendered: Vec<String> = entries.iter().map(render_entry).collect();
    Ok(Value::String(rendered.join("\n")))
}

fn render_entry(entry: &LogEntry) -> String {
    let mut line = format!(
        "[{:>5}] {} {:<9} {}",
        entry.sequence,
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.level.label(),
        entry.message
    );
    if let (Some(file), Some(number)) = (&entry.source_file, entry.source_line) {
        line.push_str(&format!(" ({file}:{number})"));
    }
    if let Some(stack) = entry.truncated_stack.as_ref().or(entry.stack_trace.as_ref()) {
        for frame in stack.lines() {
            line.push_str("\n        ");
            line.push_str(frame);
        }
    }
    line
}

pub async fn sessions(store: &CoordinationStore, limit: u32) -> Result<Value, CliError> {
    Ok(json!(store.list_sessions(limit).await?))
}

pub async fn summary(store: &CoordinationStore, session: Option<&str>) -> Result<Value, CliError> {
    let session = resolve_session(store, session).await?;
    Ok(json!(store.session_summary(session).await?))
}

pub async fn host(store: &CoordinationStore, instance: Option<&str>) -> Result<Value, CliError> {
    match store.host_status(instance).await? {
        Some(status) => {
            let age_ms = (Utc::now() - status.heartbeat).num_milliseconds().max(0);
            let mut view = json!(status);
            view["heartbeat_age_ms"] = json!(age_ms);
            Ok(view)
        }
        None => Err(CliError::NotFound("no host has reported status".into())),
    }
}

pub async fn clean(store: &CoordinationStore, args: CleanArgs) -> Result<Value, CliError> {
    let keep = chrono::Duration::from_std(args.keep)
        .map_err(|err| CliError::Usage(format!("invalid --keep: {err}")))?;
    let report = store.prune(Utc::now() - keep).await?;
    if args.vacuum {
        store.vacuum().await?;
    }
    Ok(json!({ "pruned": report, "vacuumed": args.vacuum }))
}

pub async fn stats(store: &CoordinationStore) -> Result<Value, CliError> {
    Ok(json!(store.stats().await?))
}

async fn resolve_session(
    store: &CoordinationStore,
    raw: Option<&str>,
) -> Result<SessionId, CliError> {
    match raw {
        Some(raw) => raw
            .parse::<SessionId>()
            .map_err(|err| CliError::Usage(format!("invalid session id '{raw}': {err}"))),
        None => store
            .active_session()
            .await?
            .map(|session| session.id)
            .ok_or_else(|| CliError::NotFound("no active session".into())),
    }
}

/// Request view with the payload as text instead of a byte array.
pub fn snapshot_view(snapshot: &RequestSnapshot) -> Value {
    let request = &snapshot.request;
    json!({
        "id": request.id,
        "correlation_id": request.correlation_id,
        "kind": request.kind,
        "priority": request.priority,
        "status": request.status,
        "payload": request.payload_text(),
        "created_at": request.created_at,
        "started_at": request.started_at,
        "completed_at": request.completed_at,
        "result": snapshot.result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::log::LogLevel;

    #[test]
    fn generated_correlations_differ() {
        let first = generated_correlation();
        std::thread::sleep(Duration::from_millis(1));
        assert_ne!(first, generated_correlation());
        assert!(first.starts_with("cli-"));
    }

    #[test]
    fn rendered_entry_shows_location_and_stack() {
        let entry = LogEntry {
            session_id: SessionId::new_v4(),
            sequence: 7,
            timestamp: Utc::now(),
            level: LogLevel::Exception,
            message: "NullReferenceException".into(),
            stack_trace: Some("A () (at Assets/A.cs:3)".into()),
            truncated_stack: None,
            source_file: Some("Assets/A.cs".into()),
            source_line: Some(3),
            context: None,
            request_id: None,
        };
        let rendered = render_entry(&entry);
        assert!(rendered.starts_with("[    7] "));
        assert!(rendered.contains("Exception NullReferenceException (Assets/A.cs:3)"));
        assert!(rendered.ends_with("\n        A () (at Assets/A.cs:3)"));
    }

    #[tokio::test]
    async fn wait_times_out_on_pending_request() {
        let store = CoordinationStore::in_memory().await.expect("store");
        store
            .submit(NewRequest::new("slow", "refresh"))
            .await
            .expect("submit");
        let polling = PollingArgs {
            timeout: Duration::from_millis(30),
            interval: Duration::from_millis(10),
        };
        let err = wait(&store, &RequestLookup::Correlation("slow".into()), &polling)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("still pending"));
    }
}
