//! Agent CRUD and assignment operations.

use super::{Database, Snapshot, new_id, now};
use crate::error::{CoreError, CoreResult};
use crate::types::{Agent, AgentStatus, CreateAgentInput, Task, UpdateAgentInput};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Outcome of releasing an agent.
#[derive(Debug, Clone)]
pub struct Release {
    pub agent: Agent,
    /// The task the agent was holding, after it was reset.
    pub task: Option<Task>,
    pub cancelled_sessions: Vec<String>,
}

/// Assign `task_id` to `agent_id` inside a snapshot.
///
/// The task must be dispatchable and the agent idle. Sets the agent busy and
/// the task `dispatched`.
pub(crate) fn assign_in(
    snapshot: &mut Snapshot,
    agent_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<(Agent, Task)> {
    snapshot.task(task_id)?.ensure_dispatchable()?;

    let agent = snapshot.agent_mut(agent_id)?;
    agent.assign(task_id, now)?;
    let agent = agent.clone();

    let task = snapshot.task_mut(task_id)?;
    task.mark_dispatched(agent_id, now)?;
    Ok((agent, task.clone()))
}

/// Release `agent_id` inside a snapshot.
///
/// With `force` the agent is cleared even when already idle.
pub(crate) fn release_in(
    snapshot: &mut Snapshot,
    agent_id: &str,
    force: bool,
    now: DateTime<Utc>,
) -> CoreResult<Release> {
    let agent = snapshot.agent_mut(agent_id)?;
    let held = if force {
        agent.clear(now)
    } else {
        agent.release(now)?
    };
    let agent = agent.clone();

    let mut task = None;
    if let Some(task_id) = held
        && let Ok(t) = snapshot.task_mut(&task_id)
    {
        if t.agent_id.as_deref() == Some(agent_id) {
            t.return_to_pending(now);
        }
        task = Some(t.clone());
    }

    let cancelled_sessions = snapshot.cancel_active_sessions(now, |s| s.agent_id == agent_id);
    debug!(
        agent_id,
        task_id = ?task.as_ref().map(|t| &t.id),
        cancelled = cancelled_sessions.len(),
        "Released agent"
    );

    Ok(Release {
        agent,
        task,
        cancelled_sessions,
    })
}

impl Database {
    /// List agents, optionally filtered by status, in creation order.
    pub fn list_agents(&self, status: Option<AgentStatus>) -> CoreResult<Vec<Agent>> {
        self.with_data(|data| {
            Ok(data
                .agents
                .iter()
                .filter(|a| status.is_none_or(|s| a.status == s))
                .cloned()
                .collect())
        })
    }

    /// Get an agent by ID.
    pub fn get_agent(&self, agent_id: &str) -> CoreResult<Option<Agent>> {
        self.with_data(|data| Ok(data.agents.iter().find(|a| a.id == agent_id).cloned()))
    }

    /// Register a new idle agent.
    pub fn create_agent(&self, input: CreateAgentInput) -> CoreResult<Agent> {
        let now = now();
        let agent = Agent {
            id: new_id(),
            name: input.name,
            role: input.role,
            status: AgentStatus::Idle,
            current_task_id: None,
            session_key: None,
            created_at: now,
            updated_at: now,
        };

        self.with_data_mut(|data| {
            data.agents.push(agent.clone());
            Ok(())
        })?;

        Ok(agent)
    }

    /// Administrative update.
    ///
    /// Name, role and session key change freely. Status may move between
    /// idle, offline and error; becoming or leaving busy, and changing the
    /// current task, only happen through assign and release.
    pub fn update_agent(&self, agent_id: &str, input: UpdateAgentInput) -> CoreResult<Agent> {
        let now = now();
        self.with_data_mut(|data| {
            let agent = data.agent_mut(agent_id)?;

            if let Some(current) = &input.current_task_id
                && *current != agent.current_task_id
            {
                return Err(CoreError::invalid_state(
                    "current_task_id can only change through assign or release",
                ));
            }
            if let Some(status) = input.status
                && status != agent.status
                && (status == AgentStatus::Busy || agent.status == AgentStatus::Busy)
            {
                return Err(CoreError::invalid_state(format!(
                    "Agent {} cannot move from {} to {} directly; use assign or release",
                    agent.id, agent.status, status
                )));
            }

            if let Some(name) = input.name {
                agent.name = name;
            }
            if let Some(role) = input.role {
                agent.role = role;
            }
            if let Some(status) = input.status {
                agent.status = status;
            }
            if let Some(session_key) = input.session_key {
                agent.session_key = session_key;
            }
            agent.updated_at = now;
            Ok(agent.clone())
        })
    }

    /// Idle agents, oldest first.
    pub fn list_idle_agents(&self) -> CoreResult<Vec<Agent>> {
        self.with_data(|data| Ok(data.idle_agents().into_iter().cloned().collect()))
    }

    /// Assign a task to an idle agent and mark the task dispatched.
    pub fn assign_agent(&self, agent_id: &str, task_id: &str) -> CoreResult<(Agent, Task)> {
        let now = now();
        self.with_data_mut(|data| assign_in(data, agent_id, task_id, now))
    }

    /// Release a non-idle agent.
    ///
    /// A held task that was dispatched or in progress returns to `pending`
    /// and the agent's active sessions are cancelled.
    pub fn release_agent(&self, agent_id: &str) -> CoreResult<Release> {
        let now = now();
        self.with_data_mut(|data| release_in(data, agent_id, false, now))
    }

    /// Unconditional form of [`Database::release_agent`].
    pub fn clear_agent(&self, agent_id: &str) -> CoreResult<Release> {
        let now = now();
        self.with_data_mut(|data| release_in(data, agent_id, true, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateTaskInput, TaskStatus};

    fn setup() -> (Database, Agent, Task) {
        let db = Database::open_in_memory();
        let agent = db
            .create_agent(CreateAgentInput {
                name: "Ada".into(),
                role: "writer".into(),
            })
            .unwrap();
        let task = db
            .create_task(CreateTaskInput {
                title: "Write docs".into(),
                ..Default::default()
            })
            .unwrap();
        (db, agent, task)
    }

    #[test]
    fn assign_sets_both_sides() {
        let (db, agent, task) = setup();
        let (agent, task) = db.assign_agent(&agent.id, &task.id).unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.current_task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(task.status, TaskStatus::Dispatched);
        assert_eq!(task.agent_id.as_deref(), Some(agent.id.as_str()));
    }

    #[test]
    fn failed_assign_leaves_store_untouched() {
        let (db, agent, task) = setup();
        db.update_task_status(&task.id, TaskStatus::Cancelled)
            .unwrap();
        assert!(db.assign_agent(&agent.id, &task.id).is_err());
        let agent = db.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[test]
    fn admin_update_cannot_make_agent_busy() {
        let (db, agent, _) = setup();
        let err = db
            .update_agent(
                &agent.id,
                UpdateAgentInput {
                    status: Some(AgentStatus::Busy),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        let updated = db
            .update_agent(
                &agent.id,
                UpdateAgentInput {
                    status: Some(AgentStatus::Offline),
                    session_key: Some(Some("key-1".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, AgentStatus::Offline);
        assert_eq!(updated.session_key.as_deref(), Some("key-1"));
    }

    #[test]
    fn clear_idle_agent_is_noop() {
        let (db, agent, _) = setup();
        let release = db.clear_agent(&agent.id).unwrap();
        assert!(release.task.is_none());
        assert_eq!(release.agent.status, AgentStatus::Idle);
        assert!(matches!(
            db.release_agent(&agent.id),
            Err(CoreError::AlreadyIdle(_))
        ));
    }
}
