//! Task CRUD operations.

use super::{Database, Snapshot, new_id, now};
use crate::error::{CoreError, CoreResult};
use crate::types::{
    CreateTaskInput, Task, TaskFilter, TaskStatus, UpdateTaskInput, PRIORITY_DEFAULT,
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Drop the agent that holds `task_id` and cancel the task's active sessions.
///
/// Used whenever a task stops holding an agent outside of a normal release.
pub(crate) fn detach_agent(snapshot: &mut Snapshot, task_id: &str, now: DateTime<Utc>) {
    for agent in snapshot
        .agents
        .iter_mut()
        .filter(|a| a.current_task_id.as_deref() == Some(task_id))
    {
        agent.clear(now);
        debug!(agent_id = %agent.id, task_id, "Cleared agent's current task");
    }
    let cancelled = snapshot.cancel_active_sessions(now, |s| s.task_id == task_id);
    if !cancelled.is_empty() {
        debug!(task_id, sessions = ?cancelled, "Cancelled active sessions");
    }
}

/// Apply a field update to one task inside a snapshot.
pub(crate) fn apply_task_update(
    snapshot: &mut Snapshot,
    task_id: &str,
    input: UpdateTaskInput,
    now: DateTime<Utc>,
) -> CoreResult<Task> {
    let task = snapshot.task_mut(task_id)?;
    let previous_agent = task.agent_id.clone();

    if let Some(Some(agent_id)) = &input.agent_id
        && previous_agent.as_deref() != Some(agent_id.as_str())
    {
        return Err(CoreError::invalid_state(
            "agent_id can only be set by dispatching or assigning the task",
        ));
    }

    if let Some(status) = input.status
        && status != task.status
    {
        if task.status.is_terminal() {
            return Err(CoreError::invalid_state(format!(
                "Task {} is {} and cannot change status",
                task.id, task.status
            )));
        }
        if status.holds_agent() && previous_agent.is_none() {
            return Err(CoreError::invalid_state(format!(
                "Task {} has no agent; dispatch or assign it instead of setting {}",
                task.id, status
            )));
        }
    }

    let mut next = task.clone();
    if let Some(title) = input.title {
        next.title = title;
    }
    if let Some(description) = input.description {
        next.description = description;
    }
    if let Some(priority) = input.priority {
        next.priority = priority;
    }
    if let Some(deliverables) = input.deliverables {
        next.deliverables = deliverables;
    }
    if let Some(None) = input.agent_id {
        next.agent_id = None;
    }
    if let Some(status) = input.status
        && status != next.status
    {
        next.update_status(status, now);
    }
    next.updated_at = now;

    if next.status.holds_agent() && next.agent_id.is_none() {
        return Err(CoreError::invalid_state(format!(
            "Task {} is {} and must keep its agent",
            next.id, next.status
        )));
    }

    *task = next.clone();
    if previous_agent.is_some() && next.agent_id.is_none() {
        detach_agent(snapshot, task_id, now);
    }
    Ok(next)
}

impl Database {
    /// List tasks matching the filter, highest priority first.
    ///
    /// Tasks with equal priority keep their insertion order.
    pub fn list_tasks(&self, filter: &TaskFilter) -> CoreResult<Vec<Task>> {
        self.with_data(|data| {
            let mut tasks: Vec<Task> = data
                .tasks
                .iter()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect();
            tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
            Ok(tasks)
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> CoreResult<Option<Task>> {
        self.with_data(|data| Ok(data.tasks.iter().find(|t| t.id == task_id).cloned()))
    }

    /// Create a new task in `pending`.
    pub fn create_task(&self, input: CreateTaskInput) -> CoreResult<Task> {
        let now = now();
        let task = Task {
            id: new_id(),
            title: input.title,
            description: input.description.filter(|d| !d.is_empty()),
            status: TaskStatus::Pending,
            priority: input.priority.unwrap_or(PRIORITY_DEFAULT),
            agent_id: None,
            deliverables: Vec::new(),
            planning_session_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.with_data_mut(|data| {
            data.tasks.push(task.clone());
            Ok(())
        })?;

        Ok(task)
    }

    /// Update task fields.
    ///
    /// Status changes follow the timestamp rules. An update that would leave
    /// the task holding no agent while dispatched (or the reverse) is rejected.
    /// If the update drops the task's agent, that agent is cleared and the
    /// task's active sessions are cancelled in the same write.
    pub fn update_task(&self, task_id: &str, input: UpdateTaskInput) -> CoreResult<Task> {
        let now = now();
        self.with_data_mut(|data| apply_task_update(data, task_id, input, now))
    }

    /// Change only the status of a task.
    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> CoreResult<Task> {
        self.update_task(
            task_id,
            UpdateTaskInput {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    /// Attach a planning session and move the task to `planning`.
    ///
    /// The session must belong to the task and still be open.
    pub fn link_planning_session(
        &self,
        task_id: &str,
        planning_session_id: &str,
    ) -> CoreResult<Task> {
        let now = now();
        self.with_data_mut(|data| {
            let planning = data.planning_session(planning_session_id)?;
            if planning.task_id != task_id {
                return Err(CoreError::invalid_state(format!(
                    "Planning session {} belongs to task {}",
                    planning.id, planning.task_id
                )));
            }
            if planning.completed {
                return Err(CoreError::invalid_state(format!(
                    "Planning session {} is already completed",
                    planning.id
                )));
            }
            let task = data.task_mut(task_id)?;
            if task.status.holds_agent() || task.status.is_terminal() {
                return Err(CoreError::invalid_state(format!(
                    "Task {} is {} and cannot enter planning",
                    task.id, task.status
                )));
            }
            task.link_planning_session(planning_session_id, now);
            Ok(task.clone())
        })
    }

    /// Delete a task.
    ///
    /// Clears the agent holding it, deletes its planning session and cancels
    /// its active sessions. Session history is kept.
    pub fn delete_task(&self, task_id: &str) -> CoreResult<Task> {
        let now = now();
        self.with_data_mut(|data| {
            let idx = data
                .tasks
                .iter()
                .position(|t| t.id == task_id)
                .ok_or_else(|| CoreError::task_not_found(task_id))?;

            detach_agent(data, task_id, now);
            data.planning_sessions.retain(|p| p.task_id != task_id);
            Ok(data.tasks.remove(idx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(db: &Database, title: &str, priority: i32) -> Task {
        db.create_task(CreateTaskInput {
            title: title.to_string(),
            description: None,
            priority: Some(priority),
        })
        .unwrap()
    }

    #[test]
    fn empty_description_is_stored_as_null() {
        let db = Database::open_in_memory();
        let task = db
            .create_task(CreateTaskInput {
                title: "Write spec".into(),
                description: Some(String::new()),
                priority: None,
            })
            .unwrap();
        assert!(task.description.is_none());
        assert_eq!(task.priority, PRIORITY_DEFAULT);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn list_sorts_by_priority_descending_stably() {
        let db = Database::open_in_memory();
        let low = create(&db, "low", 2);
        let first_high = create(&db, "high-a", 8);
        let second_high = create(&db, "high-b", 8);

        let ids: Vec<String> = db
            .list_tasks(&TaskFilter::default())
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![first_high.id, second_high.id, low.id]);
    }

    #[test]
    fn setting_agent_id_directly_is_rejected() {
        let db = Database::open_in_memory();
        let task = create(&db, "t", 5);
        let err = db
            .update_task(
                &task.id,
                UpdateTaskInput {
                    agent_id: Some(Some("a1".into())),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[test]
    fn dispatched_without_agent_is_rejected() {
        let db = Database::open_in_memory();
        let task = create(&db, "t", 5);
        let err = db
            .update_task_status(&task.id, TaskStatus::Dispatched)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(
            db.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn terminal_task_cannot_change_status() {
        let db = Database::open_in_memory();
        let task = create(&db, "t", 5);
        db.update_task_status(&task.id, TaskStatus::Cancelled)
            .unwrap();
        assert!(
            db.update_task_status(&task.id, TaskStatus::Pending)
                .is_err()
        );
    }

    #[test]
    fn delete_unknown_task_is_not_found() {
        let db = Database::open_in_memory();
        assert!(db.delete_task("missing").unwrap_err().is_not_found());
    }
}
