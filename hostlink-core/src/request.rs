use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RequestId = i64;

/// A driver-submitted unit of work, as stored in the coordination store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinationRequest {
    pub id: RequestId,
    pub correlation_id: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub priority: i64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_ref: Option<i64>,
}

impl CoordinationRequest {
    /// Decode the opaque payload as JSON. An empty payload decodes as `null`.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.payload.is_empty() {
            return serde_json::from_value(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.payload)
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRequest {
    pub correlation_id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub priority: i64,
}

impl NewRequest {
    pub fn new(correlation_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: kind.into(),
            payload: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Answer to a submit. `duplicate` is set when the correlation id was already
/// known; `request` then carries the original row, untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub request: CoordinationRequest,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestLookup {
    Id(RequestId),
    Correlation(String),
}

impl fmt::Display for RequestLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Correlation(correlation) => write!(f, "correlation '{correlation}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Inconclusive,
}

impl RequestStatus {
    pub const TERMINAL: [RequestStatus; 4] = [
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Inconclusive,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Inconclusive
        )
    }

    /// Transitions only move forward: Pending -> Running | Cancelled and
    /// Running -> Completed | Failed | Inconclusive.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Inconclusive)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Inconclusive => "inconclusive",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "inconclusive" => Ok(Self::Inconclusive),
            other => Err(format!("unknown request status '{other}'")),
        }
    }
}

/// Result row a finished request points at through `result_ref`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestResult {
    pub id: i64,
    pub request_id: RequestId,
    pub summary: Option<String>,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal write the host performs for a Running request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFinish {
    pub status: RequestStatus,
    pub summary: Option<String>,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl RequestFinish {
    pub fn completed(summary: Option<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            status: RequestStatus::Completed,
            summary,
            data,
            error_message: None,
            stack_trace: None,
        }
    }

    pub fn failed(message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self {
            status: RequestStatus::Failed,
            summary: None,
            data: None,
            error_message: Some(message.into()),
            stack_trace,
        }
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            status: RequestStatus::Inconclusive,
            summary: Some(reason.into()),
            data: None,
            error_message: None,
            stack_trace: None,
        }
    }
}

/// What a driver sees when it polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request: CoordinationRequest,
    pub result: Option<RequestResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The request had already left Pending; nothing changed.
    NotPending(RequestStatus),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Inconclusive));
        assert!(!Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in RequestStatus::TERMINAL {
            for next in [Pending, Running, Completed, Failed, Cancelled, Inconclusive] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_labels_parse_back() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Running,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Cancelled,
            RequestStatus::Inconclusive,
        ] {
            assert_eq!(status.label().parse::<RequestStatus>(), Ok(status));
        }
        assert!("done".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn empty_payload_decodes_as_null() {
        let request = CoordinationRequest {
            id: 1,
            correlation_id: "c".into(),
            kind: "refresh".into(),
            payload: Vec::new(),
            priority: 0,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_ref: None,
        };
        let value: Option<serde_json::Value> = request.payload_json().expect("decode");
        assert!(value.is_none());
    }

    #[test]
    fn cancel_outcome_serializes_with_status() {
        let encoded =
            serde_json::to_value(CancelOutcome::NotPending(RequestStatus::Running)).expect("json");
        assert_eq!(
            encoded,
            serde_json::json!({"outcome": "not_pending", "status": "running"})
        );
    }
}
