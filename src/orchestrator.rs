//! Orchestration operations.
//!
//! Each operation validates through the entity state machines, applies all
//! entity changes in one store write and only then talks to the agent
//! runner. A spawn that cannot be sent never rolls back the dispatch.

use crate::db::agents::{Release, assign_in};
use crate::db::sessions::new_session;
use crate::db::{self, Database, Snapshot};
use crate::error::{CoreError, CoreResult, EntityKind};
use crate::gateway::{AgentRunner, GatewayEvent, SpawnCommand, StatusUpdate};
use crate::types::{
    Agent, NewPlanningAnswer, NewPlanningQuestion, PlanningSession, Session, Task, TaskStatus,
    UpdateTaskInput, priority_label,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn default_true() -> bool {
    true
}

/// Parameters for dispatching a task.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    /// Explicit agent; when absent the oldest idle agent is picked.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_true")]
    pub auto_assign: bool,
    /// Passed through to the runner untouched.
    #[serde(default)]
    pub agent_config: Option<Value>,
}

impl Default for DispatchRequest {
    fn default() -> Self {
        Self {
            agent_id: None,
            auto_assign: true,
            agent_config: None,
        }
    }
}

impl DispatchRequest {
    pub fn to_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub task: Task,
    pub session: Session,
    /// False when the spawn was queued because the runner is unreachable.
    pub spawned: bool,
}

/// Coordinates the store and the agent runner.
pub struct Orchestrator {
    db: Arc<Database>,
    runner: Arc<dyn AgentRunner>,
}

impl Orchestrator {
    pub fn new(db: Arc<Database>, runner: Arc<dyn AgentRunner>) -> Self {
        Self { db, runner }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Hand a task to an agent and ask the runner to start it.
    pub fn dispatch(&self, task_id: &str, request: DispatchRequest) -> CoreResult<DispatchOutcome> {
        let now = db::now();
        let DispatchRequest {
            agent_id,
            auto_assign,
            agent_config,
        } = request;

        let (task, agent, session) = self.db.with_data_mut(|data| {
            data.task(task_id)?.ensure_dispatchable()?;

            let agent_id = match agent_id {
                Some(id) => id,
                None if auto_assign => data
                    .idle_agents()
                    .first()
                    .map(|a| a.id.clone())
                    .ok_or(CoreError::NoAgentAvailable)?,
                None => {
                    return Err(CoreError::validation(
                        "agent_id",
                        "no agent specified and auto-assign is disabled",
                    ));
                }
            };

            let (agent, task) = assign_in(data, &agent_id, task_id, now)?;
            let session = new_session(&agent_id, task_id, now);
            data.sessions.push(session.clone());
            Ok((task, agent, session))
        })?;

        info!(
            task_id,
            agent_id = %agent.id,
            session_id = %session.id,
            priority = priority_label(task.priority),
            "Task dispatched"
        );

        let description = format!(
            "{}: {}",
            task.title,
            task.description.as_deref().unwrap_or("")
        );
        let spawned = self.runner.spawn_agent(SpawnCommand::new(
            agent.name.as_str(),
            description,
            session.id.as_str(),
            agent_config,
        ));

        let task = if spawned {
            let now = db::now();
            self.db.with_data_mut(|data| {
                let task = data.task_mut(task_id)?;
                if task.status == TaskStatus::Dispatched {
                    task.update_status(TaskStatus::InProgress, now);
                }
                Ok(task.clone())
            })?
        } else {
            info!(task_id, session_id = %session.id, "Agent spawn queued until the gateway is reachable");
            task
        };

        Ok(DispatchOutcome {
            task,
            session,
            spawned,
        })
    }

    /// Directly assign a task to an agent without creating a session.
    pub fn assign(&self, agent_id: &str, task_id: &str) -> CoreResult<(Agent, Task)> {
        let (agent, task) = self.db.assign_agent(agent_id, task_id)?;
        info!(agent_id, task_id, "Agent assigned");
        Ok((agent, task))
    }

    /// Release a busy agent, resetting its task and cancelling its sessions.
    pub fn release(&self, agent_id: &str) -> CoreResult<Release> {
        let release = self.db.release_agent(agent_id)?;
        info!(
            agent_id,
            task_id = ?release.task.as_ref().map(|t| &t.id),
            cancelled_sessions = release.cancelled_sessions.len(),
            "Agent released"
        );
        Ok(release)
    }

    pub fn update_task(&self, task_id: &str, input: UpdateTaskInput) -> CoreResult<Task> {
        let task = self.db.update_task(task_id, input)?;
        debug!(task_id, status = %task.status, "Task updated");
        Ok(task)
    }

    /// Delete a task, freeing its agent and dropping its planning session.
    pub fn delete_task(&self, task_id: &str) -> CoreResult<Task> {
        let task = self.db.delete_task(task_id)?;
        info!(task_id, title = %task.title, "Task deleted");
        Ok(task)
    }

    pub fn start_planning(
        &self,
        task_id: &str,
        questions: Vec<NewPlanningQuestion>,
    ) -> CoreResult<PlanningSession> {
        let session = self.db.create_planning_session(task_id, questions)?;
        info!(
            task_id,
            planning_session_id = %session.id,
            questions = session.questions.len(),
            "Planning started"
        );
        Ok(session)
    }

    /// Submit answers to the planning session of `task_id`.
    pub fn submit_answers(
        &self,
        task_id: &str,
        answers: Vec<NewPlanningAnswer>,
    ) -> CoreResult<PlanningSession> {
        let planning = self
            .db
            .get_planning_session_by_task(task_id)?
            .ok_or_else(|| CoreError::NotFound {
                kind: EntityKind::PlanningSession,
                id: format!("task {task_id}"),
            })?;
        let session = self.db.submit_planning_answers(&planning.id, answers)?;
        if session.completed {
            info!(task_id, planning_session_id = %session.id, "Planning completed; task ready");
        }
        Ok(session)
    }

    /// Complete a session. Does not free the agent.
    pub fn complete_session(
        &self,
        session_id: &str,
        error_message: Option<String>,
    ) -> CoreResult<Session> {
        let session = self.db.complete_session(session_id, error_message)?;
        info!(session_id, status = %session.status, "Session completed");
        Ok(session)
    }

    /// Cancel a session. Does not free the agent.
    pub fn cancel_session(&self, session_id: &str) -> CoreResult<Session> {
        let session = self.db.cancel_session(session_id)?;
        info!(session_id, "Session cancelled");
        Ok(session)
    }

    /// Fold a runner status report into the session, its task and its agent.
    pub fn apply_status_update(&self, update: &StatusUpdate) -> CoreResult<Session> {
        let now = db::now();
        self.db
            .with_data_mut(|data| apply_status_in(data, update, now))
    }

    /// Consume gateway events until the channel closes.
    pub fn spawn_status_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<GatewayEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GatewayEvent::AgentStatus(update)) => {
                        match orchestrator.apply_status_update(&update) {
                            Ok(session) => debug!(
                                session_id = %session.id,
                                status = %session.status,
                                "Applied runner status"
                            ),
                            Err(e) => warn!(
                                session_id = %update.session_id,
                                error = %e,
                                "Ignoring runner status update"
                            ),
                        }
                    }
                    Ok(GatewayEvent::ReconnectExhausted) => warn!(
                        "Gateway reconnect attempts exhausted; spawns stay queued until it reconnects"
                    ),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status listener fell behind gateway events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn apply_status_in(
    data: &mut Snapshot,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) -> CoreResult<Session> {
    let session = data.session_mut(&update.session_id)?;
    if session.status.is_terminal() {
        return Err(CoreError::SessionAlreadyTerminal {
            session_id: session.id.clone(),
            status: session.status,
        });
    }
    if let Some(output) = &update.output {
        session.append_output(output, now);
    }

    let terminal = match update.status.as_str() {
        "running" | "busy" | "in_progress" => None,
        "completed" | "idle" => {
            session.complete(None, now)?;
            Some(TaskStatus::Completed)
        }
        "failed" | "error" => {
            let message = update
                .error
                .clone()
                .unwrap_or_else(|| "Agent reported failure".to_string());
            session.complete(Some(message), now)?;
            Some(TaskStatus::Failed)
        }
        "cancelled" => {
            session.cancel(now)?;
            Some(TaskStatus::Pending)
        }
        other => {
            debug!(session_id = %session.id, status = other, "Unmapped runner status");
            return Ok(session.clone());
        }
    };
    let session = session.clone();

    // A stale session must not disturb a task that has moved on to another agent.
    if let Ok(task) = data.task_mut(&session.task_id)
        && task.agent_id.as_deref() == Some(session.agent_id.as_str())
    {
        match terminal {
            None if task.status == TaskStatus::Dispatched => {
                task.update_status(TaskStatus::InProgress, now);
            }
            None => {}
            Some(TaskStatus::Pending) => {
                task.return_to_pending(now);
            }
            Some(status) => task.update_status(status, now),
        }
    }

    if terminal.is_some()
        && let Ok(agent) = data.agent_mut(&session.agent_id)
        && agent.current_task_id.as_deref() == Some(session.task_id.as_str())
    {
        agent.clear(now);
    }

    Ok(session)
}
