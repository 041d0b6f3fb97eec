//! Request handlers the reference daemon ships with.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use hostlink_core::request::CoordinationRequest;
use hostlink_runtime::{HandlerOutcome, HandlerRegistry, RequestHandler};

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(EchoHandler))
        .with(Arc::new(ShellHandler))
}

/// Completes with the payload it was given. JSON payloads come back as data,
/// anything else as the summary.
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn handle(&self, request: &CoordinationRequest) -> Result<HandlerOutcome> {
        match serde_json::from_slice::<serde_json::Value>(&request.payload) {
            Ok(value) => Ok(HandlerOutcome::with_data(value)),
            Err(_) => Ok(HandlerOutcome::with_summary(request.payload_text())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellPayload {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// Runs a program and reports its output. A plain-text payload runs through
/// `sh -c`.
pub struct ShellHandler;

impl ShellHandler {
    fn command(request: &CoordinationRequest) -> Result<Command> {
        let text = request.payload_text();
        if text.trim().is_empty() {
            bail!("shell request has an empty payload");
        }
        if text.trim_start().starts_with('{') {
            let payload: ShellPayload =
                serde_json::from_str(&text).context("decoding shell payload")?;
            let mut command = Command::new(&payload.program);
            command.args(&payload.args);
            if let Some(cwd) = payload.cwd {
                command.current_dir(cwd);
            }
            return Ok(command);
        }
        let mut command = Command::new("sh");
        command.arg("-c").arg(text);
        Ok(command)
    }
}

#[async_trait]
impl RequestHandler for ShellHandler {
    fn kind(&self) -> &str {
        "shell"
    }

    async fn handle(&self, request: &CoordinationRequest) -> Result<HandlerOutcome> {
        let output = Self::command(request)?
            .kill_on_drop(true)
            .output()
            .await
            .context("spawning shell command")?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => Ok(HandlerOutcome::Completed {
                summary: stdout.lines().last().map(str::to_string),
                data: Some(json!({ "exit_code": 0, "stdout": stdout, "stderr": stderr })),
            }),
            Some(code) => bail!("command exited with status {code}: {}", stderr.trim()),
            // Killed by a signal: whatever it changed may be half done.
            None => Ok(HandlerOutcome::Inconclusive(format!(
                "command terminated by signal ({})",
                output.status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hostlink_core::request::RequestStatus;

    fn request(kind: &str, payload: &str) -> CoordinationRequest {
        CoordinationRequest {
            id: 1,
            correlation_id: "t-1".into(),
            kind: kind.into(),
            payload: payload.as_bytes().to_vec(),
            priority: 0,
            status: RequestStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            result_ref: None,
        }
    }

    #[tokio::test]
    async fn echo_returns_json_as_data() {
        let outcome = EchoHandler
            .handle(&request("echo", r#"{"scene":"Main"}"#))
            .await
            .expect("echo");
        assert_eq!(outcome, HandlerOutcome::with_data(json!({ "scene": "Main" })));

        let outcome = EchoHandler
            .handle(&request("echo", "plain"))
            .await
            .expect("echo");
        assert_eq!(outcome, HandlerOutcome::with_summary("plain"));
    }

    #[tokio::test]
    async fn shell_success_and_failure() {
        let outcome = ShellHandler
            .handle(&request("shell", "echo built"))
            .await
            .expect("shell");
        let HandlerOutcome::Completed { summary, data } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.as_deref(), Some("built"));
        assert_eq!(data.expect("data")["exit_code"], 0);

        let err = ShellHandler
            .handle(&request("shell", "echo broken >&2; exit 3"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "command exited with status 3: broken");
    }

    #[tokio::test]
    async fn shell_killed_by_signal_is_inconclusive() {
        let outcome = ShellHandler
            .handle(&request("shell", "kill -9 $$"))
            .await
            .expect("shell");
        assert!(matches!(outcome, HandlerOutcome::Inconclusive(_)));
    }

    #[tokio::test]
    async fn shell_json_payload_runs_program_directly() {
        let outcome = ShellHandler
            .handle(&request("shell", r#"{"program":"printf","args":["%s","ok"]}"#))
            .await
            .expect("shell");
        assert!(matches!(
            outcome,
            HandlerOutcome::Completed { summary: Some(ref s), .. } if s == "ok"
        ));
    }
}
