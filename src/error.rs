//! Structured error types for core operations.

use crate::types::{AgentStatus, SessionStatus};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (4xx-like)
    InvalidFieldValue,
    InvalidState,
    AgentUnavailable,
    AlreadyIdle,
    SessionAlreadyTerminal,

    // Not found errors
    TaskNotFound,
    AgentNotFound,
    SessionNotFound,
    PlanningSessionNotFound,

    // Availability
    NoAgentAvailable,
    GatewayUnavailable,

    // Internal errors
    StorageError,
}

/// The kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Agent,
    Session,
    PlanningSession,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Task => "Task",
            EntityKind::Agent => "Agent",
            EntityKind::Session => "Session",
            EntityKind::PlanningSession => "Planning session",
        };
        f.write_str(name)
    }
}

/// Errors returned by store, state-machine and orchestration operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An entity id did not resolve.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// The operation is not allowed from the entity's current status.
    #[error("{0}")]
    InvalidState(String),

    /// Assignment attempted on an agent that is not idle.
    #[error("Agent is {status}, not available for assignment")]
    AgentUnavailable { agent_id: String, status: AgentStatus },

    /// Release attempted on an agent that is already idle.
    #[error("Agent {0} is already idle")]
    AlreadyIdle(String),

    /// Completion or cancellation attempted on a finished session.
    #[error("Session {session_id} is already {status}")]
    SessionAlreadyTerminal {
        session_id: String,
        status: SessionStatus,
    },

    /// Malformed input shape.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Auto-assign found no idle agent.
    #[error("No idle agents available for assignment")]
    NoAgentAvailable,

    /// The agent-runner gateway could not be reached.
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Persisting the store failed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding the store failed.
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    // Convenience constructors

    pub fn task_not_found(task_id: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::Task,
            id: task_id.to_string(),
        }
    }

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::Agent,
            id: agent_id.to_string(),
        }
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::Session,
            id: session_id.to_string(),
        }
    }

    pub fn planning_session_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::PlanningSession,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Programmatic code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound { kind, .. } => match kind {
                EntityKind::Task => ErrorCode::TaskNotFound,
                EntityKind::Agent => ErrorCode::AgentNotFound,
                EntityKind::Session => ErrorCode::SessionNotFound,
                EntityKind::PlanningSession => ErrorCode::PlanningSessionNotFound,
            },
            CoreError::InvalidState(_) => ErrorCode::InvalidState,
            CoreError::AgentUnavailable { .. } => ErrorCode::AgentUnavailable,
            CoreError::AlreadyIdle(_) => ErrorCode::AlreadyIdle,
            CoreError::SessionAlreadyTerminal { .. } => ErrorCode::SessionAlreadyTerminal,
            CoreError::Validation { .. } => ErrorCode::InvalidFieldValue,
            CoreError::NoAgentAvailable => ErrorCode::NoAgentAvailable,
            CoreError::GatewayUnavailable(_) => ErrorCode::GatewayUnavailable,
            CoreError::Io(_) | CoreError::Serialization(_) => ErrorCode::StorageError,
        }
    }

    /// The offending input field, for validation errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            CoreError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}

/// Serializable error detail for API responses.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<&CoreError> for ErrorDetail {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            field: err.field().map(str::to_string),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes_follow_entity_kind() {
        assert_eq!(
            CoreError::task_not_found("t1").code(),
            ErrorCode::TaskNotFound
        );
        assert_eq!(
            CoreError::agent_not_found("a1").code(),
            ErrorCode::AgentNotFound
        );
        assert_eq!(
            CoreError::session_not_found("s1").code(),
            ErrorCode::SessionNotFound
        );
        assert_eq!(
            CoreError::planning_session_not_found("p1").code(),
            ErrorCode::PlanningSessionNotFound
        );
    }

    #[test]
    fn messages_name_the_entity() {
        let err = CoreError::planning_session_not_found("p1");
        assert_eq!(err.to_string(), "Planning session not found: p1");

        let err = CoreError::AgentUnavailable {
            agent_id: "a1".into(),
            status: AgentStatus::Busy,
        };
        assert_eq!(err.to_string(), "Agent is busy, not available for assignment");
    }

    #[test]
    fn error_detail_serializes_screaming_code() {
        let err = CoreError::validation("title", "must not be empty");
        let detail = ErrorDetail::from(&err);
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["code"], "INVALID_FIELD_VALUE");
        assert_eq!(json["field"], "title");
        assert_eq!(json["message"], "Invalid title: must not be empty");
    }

    #[test]
    fn io_errors_map_to_storage() {
        let err: CoreError = std::io::Error::other("disk full").into();
        assert_eq!(err.code(), ErrorCode::StorageError);
    }
}
