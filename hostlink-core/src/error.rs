use crate::request::{RequestId, RequestStatus};

#[derive(Debug, thiserror::Error)]
pub enum HostlinkError {
    #[error("infra error: {0}")]
    Infra(#[from] InfraError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// The store is not ready or the host is mid-compile. Work stays pending
    /// and is retried on the next poll tick.
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

impl HostlinkError {
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Infra(InfraError::Database(err.to_string()))
    }

    pub fn encode(err: impl std::fmt::Display) -> Self {
        Self::Infra(InfraError::Encode(err.to_string()))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Infra(InfraError::Config(message.into()))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request {0} not found")]
    NotFound(RequestId),

    #[error("invalid transition for request {id}: {from} -> {to}")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("no handler registered for request kind '{0}'")]
    UnknownKind(String),
}
