use crate::protocol::ProtocolEvent;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Idle,
    Connecting,
    InProgress,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub status: ProgressStatus,
    pub progress: u8,
    pub current_service: Option<String>,
    pub total_services: Option<u64>,
    pub completed_services: Option<u64>,
    pub message: Option<String>,
    /// Set only while `status` is [`ProgressStatus::Error`].
    pub error: Option<String>,
    pub last_event: Option<ProtocolEvent>,
}

impl ProgressState {
    pub fn connecting() -> Self {
        Self {
            status: ProgressStatus::Connecting,
            ..Self::default()
        }
    }

    pub fn fail(&mut self, err: &SessionError) {
        self.status = ProgressStatus::Error;
        self.error = Some(err.to_string());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(flatten)]
    pub state: ProgressState,
    pub connected: bool,
}

impl ProgressSnapshot {
    /// True once nothing further is expected from the current session. An
    /// error with the socket still open is advisory and does not count.
    pub fn is_settled(&self) -> bool {
        match self.state.status {
            ProgressStatus::Connecting => false,
            ProgressStatus::InProgress | ProgressStatus::Error => !self.connected,
            ProgressStatus::Idle | ProgressStatus::Completed => true,
        }
    }
}

/// The `Display` text is exactly what lands in [`ProgressState::error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Protocol,
    Connection,
    Liveness,
    ServerReported(String),
}

impl SessionError {
    /// Whether this failure tears the transport down on its own.
    pub fn forces_teardown(&self) -> bool {
        matches!(self, Self::Liveness)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => f.write_str("invalid message"),
            Self::Connection => f.write_str("connection error"),
            Self::Liveness => f.write_str("heartbeat lost"),
            Self::ServerReported(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for SessionError {}
