//! Cross-entity invariant checks over the whole store.

use super::{Database, Snapshot};
use crate::types::AgentStatus;
use serde::Serialize;
use std::fmt;

/// A single invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyIssue {
    /// A task holds an agent outside dispatched/in_progress, or the reverse.
    TaskAgentMismatch { task_id: String, status: String },
    /// An agent's busy status disagrees with its current task.
    AgentTaskMismatch { agent_id: String, status: String },
    /// A reference points at an entity that does not exist.
    DanglingReference {
        entity: String,
        id: String,
        field: String,
        target: String,
    },
    /// Two tasks claim the same agent, or agent and task disagree.
    CrossReferenceMismatch { task_id: String, agent_id: String },
    /// More than one planning session exists for one task.
    DuplicatePlanningSession { task_id: String },
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyIssue::TaskAgentMismatch { task_id, status } => {
                write!(f, "task {task_id} is {status} but its agent_id disagrees")
            }
            ConsistencyIssue::AgentTaskMismatch { agent_id, status } => {
                write!(
                    f,
                    "agent {agent_id} is {status} but its current_task_id disagrees"
                )
            }
            ConsistencyIssue::DanglingReference {
                entity,
                id,
                field,
                target,
            } => write!(f, "{entity} {id}: {field} references missing {target}"),
            ConsistencyIssue::CrossReferenceMismatch { task_id, agent_id } => {
                write!(f, "task {task_id} and agent {agent_id} do not reference each other")
            }
            ConsistencyIssue::DuplicatePlanningSession { task_id } => {
                write!(f, "task {task_id} has more than one planning session")
            }
        }
    }
}

/// Collect every invariant violation in a snapshot.
pub fn check_snapshot(data: &Snapshot) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let dangling = |entity: &str, id: &str, field: &str, target: &str| {
        ConsistencyIssue::DanglingReference {
            entity: entity.to_string(),
            id: id.to_string(),
            field: field.to_string(),
            target: target.to_string(),
        }
    };

    for task in &data.tasks {
        if task.agent_id.is_some() != task.status.holds_agent() {
            issues.push(ConsistencyIssue::TaskAgentMismatch {
                task_id: task.id.clone(),
                status: task.status.to_string(),
            });
        }
        if let Some(agent_id) = &task.agent_id {
            match data.agent(agent_id) {
                Ok(agent) if agent.current_task_id.as_deref() != Some(task.id.as_str()) => {
                    issues.push(ConsistencyIssue::CrossReferenceMismatch {
                        task_id: task.id.clone(),
                        agent_id: agent_id.clone(),
                    });
                }
                Ok(_) => {}
                Err(_) => issues.push(dangling("task", &task.id, "agent_id", "agent")),
            }
        }
        if let Some(ps_id) = &task.planning_session_id
            && data.planning_session(ps_id).is_err()
        {
            issues.push(dangling(
                "task",
                &task.id,
                "planning_session_id",
                "planning session",
            ));
        }
        if data
            .planning_sessions
            .iter()
            .filter(|p| p.task_id == task.id)
            .count()
            > 1
        {
            issues.push(ConsistencyIssue::DuplicatePlanningSession {
                task_id: task.id.clone(),
            });
        }
    }

    for agent in &data.agents {
        if agent.current_task_id.is_some() != (agent.status == AgentStatus::Busy) {
            issues.push(ConsistencyIssue::AgentTaskMismatch {
                agent_id: agent.id.clone(),
                status: agent.status.to_string(),
            });
        }
        if let Some(task_id) = &agent.current_task_id {
            match data.task(task_id) {
                Ok(task) if task.agent_id.as_deref() != Some(agent.id.as_str()) => {
                    issues.push(ConsistencyIssue::CrossReferenceMismatch {
                        task_id: task_id.clone(),
                        agent_id: agent.id.clone(),
                    });
                }
                Ok(_) => {}
                Err(_) => issues.push(dangling(
                    "agent",
                    &agent.id,
                    "current_task_id",
                    "task",
                )),
            }
        }
    }

    for session in &data.sessions {
        if data.agent(&session.agent_id).is_err() {
            issues.push(dangling("session", &session.id, "agent_id", "agent"));
        }
        // Sessions outlive deleted tasks; only active ones must resolve.
        if !session.status.is_terminal() && data.task(&session.task_id).is_err() {
            issues.push(dangling("session", &session.id, "task_id", "task"));
        }
    }

    for planning in &data.planning_sessions {
        if data.task(&planning.task_id).is_err() {
            issues.push(dangling(
                "planning session",
                &planning.id,
                "task_id",
                "task",
            ));
        }
    }

    issues
}

impl Database {
    /// Report violations of the task/agent invariants and dangling references.
    pub fn check_consistency(&self) -> Vec<ConsistencyIssue> {
        check_snapshot(&self.snapshot())
    }
}
