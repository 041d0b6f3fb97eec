use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use hostlink_core::log::LogLevel;
use hostlink_core::request::{RequestLookup, RequestStatus};

#[derive(Debug, Parser)]
#[command(
    name = "hostlink",
    version,
    about = "Drive a host through its hostlink coordination store"
)]
pub struct Cli {
    /// Coordination database. Defaults to <project>/.hostlink/coordination.db.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Project root. Discovered from the current directory when omitted.
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Emit stable JSON envelopes.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a request. Resubmitting a correlation id returns the original.
    Submit(SubmitArgs),
    /// Show a request and its result.
    Status(TargetArgs),
    /// Poll until a request reaches a terminal state.
    Wait(WaitArgs),
    /// Cancel a request that has not started.
    Cancel(CancelArgs),
    /// List recent requests, newest first.
    List(ListArgs),
    /// Show captured log entries.
    Logs(LogsArgs),
    /// List recent sessions, newest first.
    Sessions(SessionsArgs),
    /// Per-level log counts for a session.
    Summary(SummaryArgs),
    /// Host compilation state and heartbeat.
    Host(HostArgs),
    /// Delete finished requests and closed sessions past retention.
    Clean(CleanArgs),
    /// Row counts and database size.
    Stats,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Request kind, matched against the host's handlers.
    pub kind: String,

    /// Idempotency key. Generated when omitted.
    #[arg(long)]
    pub correlation: Option<String>,

    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Inline payload.
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the payload from a file.
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// Wait for a terminal state after submitting.
    #[arg(long)]
    pub wait: bool,

    #[command(flatten)]
    pub polling: PollingArgs,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Request id, or a correlation id.
    #[arg(value_parser = parse_lookup)]
    pub target: RequestLookup,
}

#[derive(Debug, Args)]
pub struct WaitArgs {
    #[arg(value_parser = parse_lookup)]
    pub target: RequestLookup,

    #[command(flatten)]
    pub polling: PollingArgs,
}

#[derive(Debug, Clone, Args)]
pub struct PollingArgs {
    /// Give up after this long.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Delay between polls.
    #[arg(long, default_value = "250ms", value_parser = parse_duration)]
    pub interval: Duration,
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    pub id: i64,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Session id. Defaults to the active session.
    #[arg(long)]
    pub session: Option<String>,

    /// Only errors, exceptions, asserts and compiler diagnostics.
    #[arg(long)]
    pub errors: bool,

    /// Only these levels. Repeatable.
    #[arg(long = "level", value_parser = parse_level)]
    pub levels: Vec<LogLevel>,

    /// Only entries emitted while this request was running.
    #[arg(long)]
    pub request: Option<i64>,

    /// Newest N entries.
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
}

#[derive(Debug, Args)]
pub struct SessionsArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

#[derive(Debug, Args)]
pub struct SummaryArgs {
    /// Session id. Defaults to the active session.
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Debug, Args)]
pub struct HostArgs {
    /// Host instance. Defaults to the most recently seen one.
    #[arg(long)]
    pub instance: Option<String>,
}

#[derive(Debug, Args)]
pub struct CleanArgs {
    /// Keep anything newer than this.
    #[arg(long, default_value = "2h", value_parser = parse_duration)]
    pub keep: Duration,

    /// Reclaim free pages afterwards.
    #[arg(long)]
    pub vacuum: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_status)]
    pub status: Option<RequestStatus>,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

fn parse_duration(input: &str) -> Result<Duration, String> {
    humantime::parse_duration(input).map_err(|err| err.to_string())
}

fn parse_status(input: &str) -> Result<RequestStatus, String> {
    input.parse()
}

fn parse_level(input: &str) -> Result<LogLevel, String> {
    input.parse()
}

fn parse_lookup(input: &str) -> Result<RequestLookup, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("request target must not be empty".into());
    }
    Ok(match trimmed.parse::<i64>() {
        Ok(id) => RequestLookup::Id(id),
        Err(_) => RequestLookup::Correlation(trimmed.to_string()),
    })
}
