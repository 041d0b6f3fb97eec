mod cli;
mod commands;
mod output;

use std::path::PathBuf;

use clap::Parser;

use cli::{Cli, Command};
use hostlink_core::error::{HostlinkError, RequestError};
use hostlink_core::layout::{DEFAULT_PROJECT_MARKER, ProjectLayout};
use hostlink_store::CoordinationStore;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Store(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Timeout(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Store(_) => 3,
            Self::NotFound(_) => 4,
            Self::Timeout(_) => 5,
        }
    }
}

impl From<HostlinkError> for CliError {
    fn from(value: HostlinkError) -> Self {
        match value {
            HostlinkError::Request(RequestError::NotFound(id)) => {
                Self::NotFound(format!("request #{id} not found"))
            }
            other => Self::Store(other.to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;

    let result = run(cli).await;
    match result {
        Ok(payload) => {
            output::print_success(json_mode, &payload);
        }
        Err(err) => {
            output::print_error(json_mode, &err);
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<serde_json::Value, CliError> {
    let db = database_path(&cli)?;
    let store = CoordinationStore::open(&db).await?;

    let result = match cli.command {
        Command::Submit(args) => commands::submit(&store, args).await,
        Command::Status(args) => commands::status(&store, &args.target).await,
        Command::Wait(args) => commands::wait(&store, &args.target, &args.polling).await,
        Command::Cancel(args) => commands::cancel(&store, args.id).await,
        Command::List(args) => commands::list(&store, args).await,
        Command::Logs(args) => commands::logs(&store, args, cli.json).await,
        Command::Sessions(args) => commands::sessions(&store, args.limit).await,
        Command::Summary(args) => commands::summary(&store, args.session.as_deref()).await,
        Command::Host(args) => commands::host(&store, args.instance.as_deref()).await,
        Command::Clean(args) => commands::clean(&store, args).await,
        Command::Stats => commands::stats(&store).await,
    };
    store.close().await;
    result
}

fn database_path(cli: &Cli) -> Result<PathBuf, CliError> {
    if let Some(db) = &cli.db {
        return Ok(db.clone());
    }
    let layout = match &cli.project {
        Some(project) => ProjectLayout::new(project),
        None => {
            let cwd = std::env::current_dir()
                .map_err(|err| CliError::Usage(format!("reading current directory: {err}")))?;
            ProjectLayout::discover(&cwd, DEFAULT_PROJECT_MARKER).map_err(|err| {
                CliError::Usage(format!("{err}; pass --project or --db"))
            })?
        }
    };
    Ok(layout.database_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping_is_stable() {
        assert_eq!(CliError::Usage("x".into()).exit_code(), 2);
        assert_eq!(CliError::Store("x".into()).exit_code(), 3);
        assert_eq!(CliError::NotFound("x".into()).exit_code(), 4);
        assert_eq!(CliError::Timeout("x".into()).exit_code(), 5);
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err = CliError::from(HostlinkError::Request(RequestError::NotFound(9)));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(err.to_string(), "request #9 not found");

        let err = CliError::from(HostlinkError::database("locked"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn explicit_db_wins_over_project() {
        let cli = Cli::try_parse_from([
            "hostlink",
            "--db",
            "/tmp/x.db",
            "--project",
            "/tmp/proj",
            "stats",
        ])
        .expect("cli parse");
        assert_eq!(database_path(&cli).expect("path"), PathBuf::from("/tmp/x.db"));

        let cli = Cli::try_parse_from(["hostlink", "--project", "/tmp/proj", "stats"])
            .expect("cli parse");
        assert_eq!(
            database_path(&cli).expect("path"),
            PathBuf::from("/tmp/proj/.hostlink/coordination.db")
        );
    }
}
