//! Execution session operations.

use super::{Database, new_id, now};
use crate::error::CoreResult;
use crate::types::{Session, SessionOutcome, SessionStatus};
use chrono::{DateTime, Utc};

/// Build a fresh active session.
pub(crate) fn new_session(agent_id: &str, task_id: &str, now: DateTime<Utc>) -> Session {
    Session {
        id: new_id(),
        agent_id: agent_id.to_string(),
        task_id: task_id.to_string(),
        status: SessionStatus::Active,
        output: None,
        error_message: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

impl Database {
    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> CoreResult<Option<Session>> {
        self.with_data(|data| {
            Ok(data
                .sessions
                .iter()
                .find(|s| s.id == session_id)
                .cloned())
        })
    }

    pub fn list_sessions_by_agent(&self, agent_id: &str) -> CoreResult<Vec<Session>> {
        self.with_data(|data| {
            Ok(data
                .sessions
                .iter()
                .filter(|s| s.agent_id == agent_id)
                .cloned()
                .collect())
        })
    }

    pub fn list_sessions_by_task(&self, task_id: &str) -> CoreResult<Vec<Session>> {
        self.with_data(|data| {
            Ok(data
                .sessions
                .iter()
                .filter(|s| s.task_id == task_id)
                .cloned()
                .collect())
        })
    }

    /// Record a new active session. Both the agent and the task must exist.
    pub fn create_session(&self, agent_id: &str, task_id: &str) -> CoreResult<Session> {
        let now = now();
        self.with_data_mut(|data| {
            data.agent(agent_id)?;
            data.task(task_id)?;
            let session = new_session(agent_id, task_id, now);
            data.sessions.push(session.clone());
            Ok(session)
        })
    }

    /// Append text to the session output.
    pub fn append_session_output(&self, session_id: &str, text: &str) -> CoreResult<Session> {
        let now = now();
        self.with_data_mut(|data| {
            let session = data.session_mut(session_id)?;
            session.append_output(text, now);
            Ok(session.clone())
        })
    }

    /// Move an active session to a terminal status.
    pub fn update_session_status(
        &self,
        session_id: &str,
        outcome: SessionOutcome,
    ) -> CoreResult<Session> {
        let now = now();
        self.with_data_mut(|data| {
            let session = data.session_mut(session_id)?;
            session.finish(outcome, None, now)?;
            Ok(session.clone())
        })
    }

    /// Complete a session; an error message marks it failed.
    pub fn complete_session(
        &self,
        session_id: &str,
        error_message: Option<String>,
    ) -> CoreResult<Session> {
        let now = now();
        self.with_data_mut(|data| {
            let session = data.session_mut(session_id)?;
            session.complete(error_message, now)?;
            Ok(session.clone())
        })
    }

    pub fn cancel_session(&self, session_id: &str) -> CoreResult<Session> {
        self.update_session_status(session_id, SessionOutcome::Cancelled)
    }
}
